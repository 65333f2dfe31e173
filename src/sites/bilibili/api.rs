//! bilibili page and JSON API scrapers.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use super::super::{compile_static_regex, decode_json};
use crate::download::{HttpClient, SegmentBase};
use crate::media::{ApiError, DashManifest, MediaDescriptor, PageInfo, Stream, StreamKind};

/// Video pages.
pub const WWW_BASE: &str = "https://www.bilibili.com";
/// JSON APIs.
pub const API_BASE: &str = "https://api.bilibili.com";
/// Category search.
pub const SEARCH_BASE: &str = "https://s.search.bilibili.com";
/// Script bundle carrying the category table.
pub const CATE_META_URL: &str =
    "https://s1.hdslb.com/bfs/static/laputa-channel/client/assets/index.c0ea30e6.js";

/// Danmaku is served in segments of six minutes.
const DANMAKU_SEGMENT_SECS: f64 = 360.0;

static INITIAL_STATE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?s)window\.__INITIAL_STATE__=(\{.*?\});\("));
static PLAYINFO_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?s)window\.__playinfo__=(\{.*?\})</script>"));
static OG_IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"property="og:image" content="([^"]*)""#));
static OG_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"property="og:title" content="([^"]*)""#));
static PAGE_PARAM_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"[?&]p=(\d+)"));
static BARE_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"([\{,])\s*([A-Za-z_$][\w$]*)\s*:"));

/// A scraped video page.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    /// What to download.
    pub descriptor: MediaDescriptor,
    /// Numeric archive id.
    pub aid: u64,
    /// `BV` id; empty for episode pages without one.
    pub bvid: String,
    /// Id of the current page's media.
    pub cid: u64,
}

impl VideoInfo {
    /// Zero-based index of the current page.
    #[must_use]
    pub fn page_index(&self) -> usize {
        self.descriptor.page.as_ref().map_or(0, |page| page.index)
    }
}

/// One page of a listing (up space, favourites, series, collection).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    /// Listing name; empty for up spaces.
    pub name: String,
    /// Owner's display name.
    pub owner: String,
    /// Items in the whole listing.
    pub total: usize,
    /// `BV` ids on this page.
    pub bvids: Vec<String>,
}

/// One entry of the category table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CateInfo {
    /// Category name.
    pub name: String,
    /// Search id.
    pub tid: Option<u64>,
    /// Whether this is a sub-category (only those can be searched).
    pub is_sub: bool,
    /// Names of the sub-categories of a main category.
    pub subs: Vec<String>,
}

/// Category search parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CateQuery {
    /// Sub-category id.
    pub tid: u64,
    /// First day, `YYYYMMDD`.
    pub time_from: String,
    /// Last day, `YYYYMMDD`.
    pub time_to: String,
    /// 1-based page number.
    pub pn: usize,
    /// Page size.
    pub ps: usize,
    /// Sort order.
    pub order: String,
    /// Keyword filter.
    pub keyword: String,
}

/// Scraper contract for bilibili.
#[async_trait]
pub trait BilibiliApi: Send + Sync {
    /// Page URL of a `BV` id.
    fn video_url(&self, bvid: &str) -> String {
        format!("{WWW_BASE}/video/{bvid}")
    }

    /// Scrapes a video or episode page.
    async fn get_video_info(&self, url: &str) -> Result<VideoInfo, ApiError>;

    /// Subtitle tracks of one page; `quality` holds the language label.
    async fn get_subtitle_tracks(&self, bvid: &str, cid: u64) -> Result<Vec<Stream>, ApiError>;

    /// One page of an up's uploads.
    async fn get_up_page(
        &self,
        mid: &str,
        pn: usize,
        ps: usize,
        order: &str,
        keyword: &str,
    ) -> Result<ListingPage, ApiError>;

    /// One page of a favourites folder.
    async fn get_favour_page(
        &self,
        fid: &str,
        pn: usize,
        ps: usize,
        keyword: &str,
    ) -> Result<ListingPage, ApiError>;

    /// The category table keyed by name.
    async fn get_cate_meta(&self) -> Result<HashMap<String, CateInfo>, ApiError>;

    /// `BV` ids of one category search page.
    async fn get_cate_page(&self, query: &CateQuery) -> Result<Vec<String>, ApiError>;

    /// A video list (`channel/seriesdetail`).
    async fn get_list_info(&self, sid: &str) -> Result<ListingPage, ApiError>;

    /// A collection (`channel/collectiondetail`).
    async fn get_collect_info(&self, sid: &str) -> Result<ListingPage, ApiError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InitialState {
    #[serde(rename = "videoData")]
    video_data: Option<VideoData>,
    #[serde(default)]
    p: Option<usize>,
    #[serde(rename = "epInfo")]
    ep_info: Option<EpInfo>,
    #[serde(rename = "initEpList", default)]
    ep_list: Vec<EpItem>,
    #[serde(default)]
    error: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct VideoData {
    title: String,
    #[serde(default)]
    pic: String,
    aid: u64,
    bvid: String,
    cid: u64,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    pages: Vec<PageData>,
}

#[derive(Debug, Deserialize)]
struct PageData {
    cid: u64,
    #[serde(default)]
    part: String,
}

#[derive(Debug, Deserialize)]
struct EpInfo {
    aid: u64,
    cid: u64,
    #[serde(default)]
    bvid: String,
    #[serde(default)]
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct EpItem {
    cid: u64,
    link: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct PlayInfo {
    #[serde(alias = "result")]
    data: PlayData,
}

#[derive(Debug, Deserialize)]
struct PlayData {
    #[serde(default)]
    accept_description: Vec<String>,
    #[serde(default)]
    accept_quality: Vec<u32>,
    dash: Option<DashData>,
    #[serde(default)]
    durl: Vec<DurlData>,
    #[serde(default)]
    format: String,
}

#[derive(Debug, Deserialize)]
struct DashData {
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    video: Vec<DashStream>,
    #[serde(default)]
    audio: Option<Vec<DashStream>>,
    #[serde(default)]
    dolby: Option<DolbyData>,
    #[serde(default)]
    flac: Option<FlacData>,
}

#[derive(Debug, Deserialize)]
struct DolbyData {
    #[serde(default)]
    audio: Option<Vec<DashStream>>,
}

#[derive(Debug, Deserialize)]
struct FlacData {
    #[serde(default)]
    audio: Option<DashStream>,
}

/// The payload repeats most keys in camelCase (`baseUrl`, `SegmentBase`);
/// only the snake_case copies are read.
#[derive(Debug, Deserialize)]
struct DashStream {
    id: u32,
    base_url: String,
    #[serde(default)]
    backup_url: Option<Vec<String>>,
    #[serde(default)]
    codecs: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    segment_base: Option<RawSegmentBase>,
}

#[derive(Debug, Deserialize)]
struct RawSegmentBase {
    initialization: String,
    index_range: String,
}

impl DashStream {
    fn segment_base(&self) -> Option<SegmentBase> {
        let raw = self.segment_base.as_ref()?;
        SegmentBase::parse(&raw.initialization, &raw.index_range)
    }
}

#[derive(Debug, Deserialize)]
struct DurlData {
    url: String,
    #[serde(default)]
    backup_url: Option<Vec<String>>,
    #[serde(default)]
    size: u64,
}

fn stream_urls(first: String, backups: Option<Vec<String>>) -> Vec<String> {
    std::iter::once(first)
        .chain(backups.unwrap_or_default())
        .collect()
}

fn audio_suffix(codecs: &str) -> &'static str {
    if codecs.starts_with("fLaC") {
        ".flac"
    } else if codecs.starts_with("ec-3") {
        ".eac3"
    } else {
        ".aac"
    }
}

fn audio_stream(stream: DashStream) -> Stream {
    let suffix = audio_suffix(&stream.codecs);
    let base = stream.segment_base();
    Stream::new(StreamKind::Audio, stream_urls(stream.base_url, stream.backup_url))
        .with_segment_base(base)
        .with_codec(stream.codecs)
        .with_quality(stream.id.to_string(), stream.id)
        .with_suffix(suffix)
}

fn dash_manifest(data: &PlayData, dash: DashData) -> DashManifest {
    let labels: HashMap<u32, &str> = data
        .accept_quality
        .iter()
        .copied()
        .zip(data.accept_description.iter().map(String::as_str))
        .collect();
    let videos = dash
        .video
        .into_iter()
        .map(|stream| {
            let label = labels
                .get(&stream.id)
                .map_or_else(|| stream.id.to_string(), |label| (*label).to_string());
            let base = stream.segment_base();
            Stream::new(StreamKind::Video, stream_urls(stream.base_url, stream.backup_url))
                .with_segment_base(base)
                .with_codec(stream.codecs)
                .with_quality(label, stream.id)
                .with_dimensions(stream.width, stream.height)
                .with_suffix(".mp4")
        })
        .collect();
    DashManifest {
        duration: dash.duration,
        videos,
        audios: dash
            .audio
            .unwrap_or_default()
            .into_iter()
            .map(audio_stream)
            .collect(),
        dolby: dash
            .dolby
            .and_then(|dolby| dolby.audio)
            .unwrap_or_default()
            .into_iter()
            .map(audio_stream)
            .collect(),
        flac: dash
            .flac
            .and_then(|flac| flac.audio)
            .into_iter()
            .map(audio_stream)
            .collect(),
    }
}

fn durl_files(format: &str, durl: Vec<DurlData>) -> Vec<Stream> {
    let suffix = format.trim_end_matches(|c: char| c.is_ascii_digit());
    let suffix = if suffix.is_empty() { "mp4" } else { suffix };
    durl.into_iter()
        .map(|part| {
            let mut stream = Stream::new(StreamKind::Muxed, stream_urls(part.url, part.backup_url))
                .with_suffix(suffix);
            stream.size = Some(part.size);
            stream
        })
        .collect()
}

fn cover_url(raw: &str) -> String {
    if raw.starts_with("http") {
        raw.to_string()
    } else {
        let trimmed = raw.split('@').next().unwrap_or_default();
        format!("http:{trimmed}")
    }
}

/// Danmaku segment URLs covering `duration` seconds.
#[must_use]
pub fn danmaku_urls(api_base: &str, aid: u64, cid: u64, duration: f64) -> Vec<String> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let segments = ((duration / DANMAKU_SEGMENT_SECS).ceil() as usize).max(1);
    (1..=segments)
        .map(|index| {
            format!("{api_base}/x/v2/dm/web/seg.so?type=1&oid={cid}&pid={aid}&segment_index={index}")
        })
        .collect()
}

/// Parses a video or episode page into a [`VideoInfo`].
///
/// # Errors
///
/// Returns [`ApiError::Unsupported`] for pages without embedded state,
/// [`ApiError::Resource`] for removed videos, or [`ApiError::Parse`] for
/// malformed embedded JSON.
pub fn parse_video_page(html: &str, url: &str, api_base: &str) -> Result<VideoInfo, ApiError> {
    let state = INITIAL_STATE_RE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| ApiError::unsupported(format!("no page state found at {url}")))?;
    let state: InitialState = decode_json("page state", state.as_str())?;
    if state.error.as_ref().is_some_and(|error| !error.is_empty()) {
        return Err(ApiError::resource("video is unavailable", url));
    }

    let og_title = OG_TITLE_RE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    let og_image = OG_IMAGE_RE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());

    let (title, aid, bvid, cid, duration, pages, index, pic) = if let Some(video) = state.video_data
    {
        let requested = PAGE_PARAM_RE
            .captures(url)
            .and_then(|caps| caps[1].parse::<usize>().ok())
            .or(state.p)
            .unwrap_or(1);
        let count = video.pages.len();
        let index = requested.saturating_sub(1).min(count.saturating_sub(1));
        let base_url = url.split('?').next().unwrap_or(url);
        let pages: Vec<PageInfo> = video
            .pages
            .iter()
            .enumerate()
            .map(|(i, page)| PageInfo {
                index: i,
                name: if count > 1 {
                    format!("P{}-{}", i + 1, page.part)
                } else {
                    String::new()
                },
                url: format!("{base_url}?p={}", i + 1),
            })
            .collect();
        let cid = video.pages.get(index).map_or(video.cid, |page| page.cid);
        (
            video.title,
            video.aid,
            video.bvid,
            cid,
            video.duration,
            pages,
            index,
            video.pic,
        )
    } else if let Some(episode) = state.ep_info {
        let pages: Vec<PageInfo> = state
            .ep_list
            .iter()
            .enumerate()
            .map(|(i, item)| PageInfo {
                index: i,
                name: item.title.clone(),
                url: item.link.clone(),
            })
            .collect();
        let index = state
            .ep_list
            .iter()
            .position(|item| item.cid == episode.cid)
            .unwrap_or(0);
        (
            og_title.clone().unwrap_or_default(),
            episode.aid,
            episode.bvid,
            episode.cid,
            episode.duration / 1000.0,
            pages,
            index,
            String::new(),
        )
    } else {
        return Err(ApiError::unsupported(format!("unknown page type at {url}")));
    };

    let mut descriptor = MediaDescriptor {
        title,
        source_url: url.to_string(),
        page: pages.get(index).cloned(),
        pages,
        ..MediaDescriptor::default()
    };

    let mut duration = duration;
    if let Some(raw) = PLAYINFO_RE.captures(html).and_then(|caps| caps.get(1)) {
        let play: PlayInfo = decode_json("play info", raw.as_str())?;
        let mut data = play.data;
        if let Some(dash) = data.dash.take() {
            let manifest = dash_manifest(&data, dash);
            if manifest.duration > 0.0 {
                duration = manifest.duration;
            }
            descriptor.dash = Some(manifest);
        }
        let durl = std::mem::take(&mut data.durl);
        descriptor.files = durl_files(&data.format, durl);
    } else {
        debug!(url = %url, "page carries no play info");
    }

    let image = og_image.filter(|s| !s.is_empty()).unwrap_or(pic);
    if !image.is_empty() {
        descriptor
            .streams
            .push(Stream::new(StreamKind::Image, vec![cover_url(&image)]));
    }
    descriptor.streams.extend(
        danmaku_urls(api_base, aid, cid, duration)
            .into_iter()
            .map(|url| Stream::new(StreamKind::Danmaku, vec![url])),
    );

    Ok(VideoInfo {
        descriptor,
        aid,
        bvid,
        cid,
    })
}

/// Returns the balanced `{...}` or `[...]` literal starting at `start`.
fn balanced_literal(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct ChannelTable {
    #[serde(rename = "channelList")]
    channels: Vec<Channel>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    name: String,
    #[serde(default)]
    tid: Option<u64>,
    #[serde(default)]
    sub: Vec<SubChannel>,
}

#[derive(Debug, Deserialize)]
struct SubChannel {
    name: String,
    tid: u64,
}

/// Extracts the category table from the channel script bundle.
///
/// The bundle holds a JavaScript object literal `{channelList:[...]}`;
/// bare keys are quoted and `!0`/`!1` turned into booleans before decoding.
///
/// # Errors
///
/// Returns [`ApiError::Unsupported`] when the table is missing, or
/// [`ApiError::Parse`] when it cannot be decoded.
pub fn parse_cate_meta(script: &str) -> Result<HashMap<String, CateInfo>, ApiError> {
    let start = script
        .find("{channelList:")
        .ok_or_else(|| ApiError::unsupported("category table not found"))?;
    let literal = balanced_literal(script, start)
        .ok_or_else(|| ApiError::unsupported("category table is truncated"))?;
    let json = BARE_KEY_RE
        .replace_all(literal, "$1\"$2\":")
        .replace("!0", "true")
        .replace("!1", "false");
    let table: ChannelTable = decode_json("category table", &json)?;

    let mut meta = HashMap::new();
    for channel in table.channels {
        let subs: Vec<String> = channel.sub.iter().map(|sub| sub.name.clone()).collect();
        for sub in channel.sub {
            meta.insert(
                sub.name.clone(),
                CateInfo {
                    name: sub.name,
                    tid: Some(sub.tid),
                    is_sub: true,
                    subs: Vec::new(),
                },
            );
        }
        meta.insert(
            channel.name.clone(),
            CateInfo {
                name: channel.name,
                tid: channel.tid,
                is_sub: false,
                subs,
            },
        );
    }
    Ok(meta)
}

/// Page and API scraper over HTTP.
#[derive(Debug, Clone)]
pub struct WebBilibiliApi {
    client: HttpClient,
    www_base: String,
    api_base: String,
    search_base: String,
    cate_meta_url: String,
}

impl WebBilibiliApi {
    /// Creates a scraper against the public hosts.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            www_base: WWW_BASE.to_string(),
            api_base: API_BASE.to_string(),
            search_base: SEARCH_BASE.to_string(),
            cate_meta_url: CATE_META_URL.to_string(),
        }
    }

    /// Creates a scraper with every host pointed at `base` (for tests). The
    /// category bundle is read from `{base}/cate_meta.js`.
    #[must_use]
    pub fn with_base_url(client: HttpClient, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            client,
            www_base: base.to_string(),
            api_base: base.to_string(),
            search_base: base.to_string(),
            cate_meta_url: format!("{base}/cate_meta.js"),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, context: &str) -> Result<T, ApiError> {
        let body = self.client.get_text(url).await?;
        let envelope: Envelope<T> = decode_json(context, &body)?;
        if envelope.code != 0 {
            return Err(ApiError::resource(
                format!("{context}: {} ({})", envelope.message, envelope.code),
                url,
            ));
        }
        envelope
            .data
            .ok_or_else(|| ApiError::resource(format!("{context}: empty response"), url))
    }
}

#[derive(Debug, Deserialize)]
struct Bvid {
    bvid: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct Upper {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct UpSearch {
    list: UpList,
    page: UpPageCount,
}

#[derive(Debug, Deserialize)]
struct UpList {
    #[serde(default)]
    vlist: Vec<UpVideo>,
}

#[derive(Debug, Deserialize)]
struct UpVideo {
    bvid: String,
    #[serde(default)]
    author: String,
}

#[derive(Debug, Deserialize)]
struct UpPageCount {
    count: usize,
}

#[derive(Debug, Deserialize)]
struct FavourData {
    info: FavourInfo,
    #[serde(default)]
    medias: Option<Vec<Bvid>>,
}

#[derive(Debug, Deserialize)]
struct FavourInfo {
    title: String,
    upper: Upper,
    #[serde(default)]
    media_count: usize,
}

#[derive(Debug, Deserialize)]
struct CateSearch {
    #[serde(default)]
    result: Option<Vec<Bvid>>,
}

#[derive(Debug, Deserialize)]
struct SeriesMeta {
    meta: SeriesInfo,
}

#[derive(Debug, Deserialize)]
struct SeriesInfo {
    name: String,
    mid: u64,
    #[serde(default)]
    total: usize,
}

#[derive(Debug, Deserialize)]
struct SeriesArchives {
    #[serde(default)]
    archives: Vec<Bvid>,
}

#[derive(Debug, Deserialize)]
struct SeasonData {
    info: SeasonInfo,
    #[serde(default)]
    medias: Vec<SeasonMedia>,
}

#[derive(Debug, Deserialize)]
struct SeasonInfo {
    title: String,
    #[serde(default)]
    media_count: usize,
}

#[derive(Debug, Deserialize)]
struct SeasonMedia {
    bvid: String,
    upper: Upper,
}

#[derive(Debug, Deserialize)]
struct PlayerData {
    subtitle: SubtitleList,
}

#[derive(Debug, Deserialize)]
struct SubtitleList {
    #[serde(default)]
    subtitles: Vec<SubtitleTrack>,
}

#[derive(Debug, Deserialize)]
struct SubtitleTrack {
    lan_doc: String,
    subtitle_url: String,
}

/// Removed favourites keep their slot under this title.
const INVALID_VIDEO_TITLE: &str = "已失效视频";

#[async_trait]
impl BilibiliApi for WebBilibiliApi {
    fn video_url(&self, bvid: &str) -> String {
        format!("{}/video/{bvid}", self.www_base)
    }

    #[instrument(skip(self))]
    async fn get_video_info(&self, url: &str) -> Result<VideoInfo, ApiError> {
        let html = self.client.get_text(url).await?;
        parse_video_page(&html, url, &self.api_base)
    }

    async fn get_subtitle_tracks(&self, bvid: &str, cid: u64) -> Result<Vec<Stream>, ApiError> {
        let url = format!("{}/x/player/v2?bvid={bvid}&cid={cid}", self.api_base);
        let data: PlayerData = self.get_json(&url, "subtitle info").await?;
        Ok(data
            .subtitle
            .subtitles
            .into_iter()
            .map(|track| {
                let url = if track.subtitle_url.starts_with("//") {
                    format!("https:{}", track.subtitle_url)
                } else {
                    track.subtitle_url
                };
                Stream::new(StreamKind::Subtitle, vec![url]).with_quality(track.lan_doc, 0)
            })
            .collect())
    }

    async fn get_up_page(
        &self,
        mid: &str,
        pn: usize,
        ps: usize,
        order: &str,
        keyword: &str,
    ) -> Result<ListingPage, ApiError> {
        let url = format!(
            "{}/x/space/arc/search?mid={mid}&order={order}&ps={ps}&pn={pn}&keyword={}",
            self.api_base,
            urlencoding::encode(keyword)
        );
        let data: UpSearch = self.get_json(&url, "up uploads").await?;
        Ok(ListingPage {
            name: String::new(),
            owner: data
                .list
                .vlist
                .first()
                .map(|video| video.author.clone())
                .unwrap_or_default(),
            total: data.page.count,
            bvids: data.list.vlist.into_iter().map(|video| video.bvid).collect(),
        })
    }

    async fn get_favour_page(
        &self,
        fid: &str,
        pn: usize,
        ps: usize,
        keyword: &str,
    ) -> Result<ListingPage, ApiError> {
        let url = format!(
            "{}/x/v3/fav/resource/list?media_id={fid}&pn={pn}&ps={ps}&keyword={}&order=mtime",
            self.api_base,
            urlencoding::encode(keyword)
        );
        let data: FavourData = self.get_json(&url, "favourites").await?;
        Ok(ListingPage {
            name: data.info.title,
            owner: data.info.upper.name,
            total: data.info.media_count,
            bvids: data
                .medias
                .unwrap_or_default()
                .into_iter()
                .filter(|media| media.title != INVALID_VIDEO_TITLE)
                .map(|media| media.bvid)
                .collect(),
        })
    }

    async fn get_cate_meta(&self) -> Result<HashMap<String, CateInfo>, ApiError> {
        let script = self.client.get_text(&self.cate_meta_url).await?;
        parse_cate_meta(&script)
    }

    async fn get_cate_page(&self, query: &CateQuery) -> Result<Vec<String>, ApiError> {
        let url = format!(
            "{}/cate/search?search_type=video&view_type=hot_rank&cate_id={}&pagesize={}&keyword={}&page={}&order={}&time_from={}&time_to={}",
            self.search_base,
            query.tid,
            query.ps,
            urlencoding::encode(&query.keyword),
            query.pn,
            query.order,
            query.time_from,
            query.time_to
        );
        let body = self.client.get_text(&url).await?;
        let search: CateSearch = decode_json("category search", &body)?;
        Ok(search
            .result
            .unwrap_or_default()
            .into_iter()
            .map(|item| item.bvid)
            .collect())
    }

    async fn get_list_info(&self, sid: &str) -> Result<ListingPage, ApiError> {
        let meta_url = format!("{}/x/series/series?series_id={sid}", self.api_base);
        let meta: SeriesMeta = self.get_json(&meta_url, "video list").await?;
        let archives_url = format!(
            "{}/x/series/archives?mid={}&series_id={sid}&ps={}&pn=1",
            self.api_base,
            meta.meta.mid,
            meta.meta.total.max(1)
        );
        let owner_url = format!("{}/x/space/acc/info?mid={}", self.api_base, meta.meta.mid);
        let (archives, owner) = futures_util::future::join(
            self.get_json::<SeriesArchives>(&archives_url, "video list items"),
            self.get_json::<Upper>(&owner_url, "up info"),
        )
        .await;
        let bvids: Vec<String> = archives?.archives.into_iter().map(|a| a.bvid).collect();
        Ok(ListingPage {
            name: meta.meta.name,
            owner: owner?.name,
            total: bvids.len(),
            bvids,
        })
    }

    async fn get_collect_info(&self, sid: &str) -> Result<ListingPage, ApiError> {
        let url = format!("{}/x/space/fav/season/list?season_id={sid}", self.api_base);
        let data: SeasonData = self.get_json(&url, "collection").await?;
        Ok(ListingPage {
            name: data.info.title,
            owner: data
                .medias
                .first()
                .map(|media| media.upper.name.clone())
                .unwrap_or_default(),
            total: data.info.media_count.max(data.medias.len()),
            bvids: data.medias.into_iter().map(|media| media.bvid).collect(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const VIDEO_PAGE: &str = r#"<html><head>
<meta property="og:title" content="Rust &amp; Tokio_哔哩哔哩_bilibili">
<meta property="og:image" content="//i0.hdslb.com/bfs/archive/cover.jpg@100w_100h.jpg">
</head><body>
<script>window.__playinfo__={"code":0,"data":{"accept_description":["1080P 高清","720P 高清"],"accept_quality":[80,64],"format":"mp4720","dash":{"duration":400,"video":[{"id":80,"baseUrl":"https://cdn/v80-avc.m4s","base_url":"https://cdn/v80-avc.m4s","backupUrl":["https://bak/v80-avc.m4s"],"backup_url":["https://bak/v80-avc.m4s"],"codecs":"avc1.640032","width":1920,"height":1080,"SegmentBase":{"Initialization":"0-907","indexRange":"908-1695"},"segment_base":{"initialization":"0-907","index_range":"908-1695"}},{"id":64,"base_url":"https://cdn/v64-avc.m4s","backup_url":null,"codecs":"avc1.64001F","width":1280,"height":720}],"audio":[{"id":30280,"base_url":"https://cdn/a.m4s","codecs":"mp4a.40.2","segment_base":{"initialization":"0-819","index_range":"820-1343"}}],"dolby":{"type":0,"audio":null},"flac":null}}}</script>
<script>window.__INITIAL_STATE__={"aid":170001,"bvid":"BV1xx411c7mD","p":1,"videoData":{"title":"Rust & Tokio","pic":"http://i0.hdslb.com/cover.jpg","aid":170001,"bvid":"BV1xx411c7mD","cid":111,"duration":400,"pages":[{"cid":111,"page":1,"part":"Intro"},{"cid":222,"page":2,"part":"Async"}]}};(function(){var s;}());</script>
</body></html>"#;

    #[test]
    fn test_parse_video_page_dash_and_pages() {
        let info = parse_video_page(
            VIDEO_PAGE,
            "https://www.bilibili.com/video/BV1xx411c7mD?p=2&spm=1",
            "https://api.bilibili.com",
        )
        .unwrap();
        assert_eq!(info.aid, 170_001);
        assert_eq!(info.bvid, "BV1xx411c7mD");
        assert_eq!(info.cid, 222);
        assert_eq!(info.page_index(), 1);

        let desc = &info.descriptor;
        assert_eq!(desc.title, "Rust & Tokio");
        assert_eq!(desc.pages.len(), 2);
        assert_eq!(desc.page_name(), "P2-Async");
        assert_eq!(
            desc.pages[0].url,
            "https://www.bilibili.com/video/BV1xx411c7mD?p=1"
        );

        let dash = desc.dash.as_ref().unwrap();
        assert_eq!(dash.videos.len(), 2);
        assert_eq!(dash.videos[0].quality, "1080P 高清");
        assert_eq!(dash.videos[0].urls.len(), 2);
        assert_eq!(dash.videos[1].urls.len(), 1);
        assert_eq!(dash.audios[0].suffix, ".aac");
        assert!(dash.dolby.is_empty() && dash.flac.is_empty());
        assert_eq!(
            dash.videos[0].segment_base,
            SegmentBase::parse("0-907", "908-1695")
        );
        assert!(dash.videos[1].segment_base.is_none());
        assert_eq!(dash.audios[0].segment_base.unwrap().index_range, (820, 1343));

        let image: Vec<_> = desc.streams_of(StreamKind::Image).collect();
        assert_eq!(image[0].urls[0], "http://i0.hdslb.com/bfs/archive/cover.jpg");
        assert_eq!(desc.streams_of(StreamKind::Danmaku).count(), 2);
    }

    #[test]
    fn test_parse_video_page_without_state_is_unsupported() {
        let err = parse_video_page("<html></html>", "https://b23.tv/x", API_BASE).unwrap_err();
        assert!(matches!(err, ApiError::Unsupported { .. }));
    }

    #[test]
    fn test_parse_video_page_reports_removed_video() {
        let html = r#"<script>window.__INITIAL_STATE__={"error":{"code":404}};(function(){})</script>"#;
        let err = parse_video_page(html, "https://www.bilibili.com/video/BV1", API_BASE).unwrap_err();
        assert!(matches!(err, ApiError::Resource { .. }));
    }

    #[test]
    fn test_danmaku_segments() {
        assert_eq!(danmaku_urls(API_BASE, 1, 2, 0.0).len(), 1);
        assert_eq!(danmaku_urls(API_BASE, 1, 2, 360.0).len(), 1);
        let urls = danmaku_urls(API_BASE, 1, 2, 361.0);
        assert_eq!(urls.len(), 2);
        assert!(urls[1].ends_with("oid=2&pid=1&segment_index=2"));
    }

    #[test]
    fn test_parse_cate_meta() {
        let script = r#"var a=1;Za={channelList:[{name:"首页",url:"//www.bilibili.com",icon:""},{name:"舞蹈",tid:129,sub:[{name:"宅舞",tid:20,subChannelId:"otaku",hidden:!1},{name:"街舞",tid:198,subChannelId:"hiphop"}]}],other:!0};function f(){}"#;
        let meta = parse_cate_meta(script).unwrap();
        let dance = &meta["舞蹈"];
        assert!(!dance.is_sub);
        assert_eq!(dance.subs, ["宅舞", "街舞"]);
        let otaku = &meta["宅舞"];
        assert!(otaku.is_sub);
        assert_eq!(otaku.tid, Some(20));
        assert!(meta.contains_key("首页"));
        assert!(parse_cate_meta("nothing here").is_err());
    }

    #[test]
    fn test_balanced_literal_skips_strings() {
        let text = r#"x={a:"}",b:[1,{c:2}]};rest"#;
        assert_eq!(balanced_literal(text, 2), Some(r#"{a:"}",b:[1,{c:2}]}"#));
        assert_eq!(balanced_literal("{open", 0), None);
    }
}

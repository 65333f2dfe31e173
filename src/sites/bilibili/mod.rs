//! bilibili.com handler.

mod api;

pub use api::{
    API_BASE, BilibiliApi, CATE_META_URL, CateInfo, CateQuery, ListingPage, SEARCH_BASE, VideoInfo,
    WWW_BASE, WebBilibiliApi, danmaku_urls, parse_cate_meta, parse_video_page,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::{Days, NaiveDate, Utc};
use futures_util::future::join_all;
use regex::Regex;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{
    DIR, HIERARCHY, MAX_CON, PART_CON, QUALITY, SPEED_LIMIT, STREAM_RETRY, TIME_RANGE,
    compile_static_regex, referer_headers,
};
use crate::dispatch::options::{CATE_ORDERS, UP_ORDERS};
use crate::dispatch::{
    DispatchError, Dispatched, EngineOptions, Handler, HandlerContext, HandlerInfo, HandlerKind,
    MethodInfo, OptionMap, ParamInfo, ParamKind, VideoOptions, run_keys,
};
use crate::download::{DownloadError, SiteCookie, sanitize};
use crate::media::{ApiError, MediaError, MediaOrchestrator, media_names};
use crate::units::page_slice;

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"^https?://([A-Za-z0-9-]+\.)*(bilibili\.com|b23\.tv)")
});
static MID_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"/(\d+)"));
static FID_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"fid=(\d+)"));
static SID_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"sid=(\d+)"));

const UP_PAGE_SIZE: usize = 30;
const FAVOUR_PAGE_SIZE: usize = 20;
const CATE_PAGE_SIZE: usize = 30;
/// Day format of category listing windows.
const DATE_STAMP: &str = "%Y%m%d";

const COOKIE: ParamInfo = ParamInfo::new("cookie", ParamKind::Text, "", "SESSDATA cookie value");
const CODEC: ParamInfo = ParamInfo::new("codec", ParamKind::Text, "", "codec prefixes, e.g. hev:fLaC");
const IMAGE: ParamInfo = ParamInfo::new("image", ParamKind::Flag, "false", "also save the cover");
const SUBTITLE: ParamInfo = ParamInfo::new("subtitle", ParamKind::Flag, "false", "also save subtitles");
const DM: ParamInfo = ParamInfo::new("dm", ParamKind::Flag, "false", "also save danmaku");
const ONLY_AUDIO: ParamInfo =
    ParamInfo::new("only_audio", ParamKind::Flag, "false", "download the audio track only");
const P_RANGE: ParamInfo = ParamInfo::new("p_range", ParamKind::Range, "", "pages START END, 1-based");
const NUM: ParamInfo = ParamInfo::new("num", ParamKind::Int, "10", "number of videos");
const ORDER: ParamInfo = ParamInfo::new("order", ParamKind::Text, "", "sort order");
const KEYWORD: ParamInfo = ParamInfo::new("keyword", ParamKind::Text, "", "keyword filter");
const DAYS: ParamInfo = ParamInfo::new("days", ParamKind::Int, "7", "search the last DAYS days");
const SERIES: ParamInfo = ParamInfo::new(
    "series",
    ParamKind::Flag,
    "true",
    "download every page of each video",
);

static INIT: [ParamInfo; 6] = [MAX_CON, PART_CON, SPEED_LIMIT, STREAM_RETRY, COOKIE, HIERARCHY];
static GET_VIDEO: [ParamInfo; 8] = [DIR, QUALITY, CODEC, IMAGE, SUBTITLE, DM, ONLY_AUDIO, TIME_RANGE];
static GET_SERIES: [ParamInfo; 8] = [DIR, QUALITY, CODEC, IMAGE, SUBTITLE, DM, ONLY_AUDIO, P_RANGE];
static GET_UP: [ParamInfo; 11] = [
    DIR, QUALITY, CODEC, IMAGE, SUBTITLE, DM, ONLY_AUDIO, NUM, ORDER, KEYWORD, SERIES,
];
static GET_FAVOUR: [ParamInfo; 10] = [
    DIR, QUALITY, CODEC, IMAGE, SUBTITLE, DM, ONLY_AUDIO, NUM, KEYWORD, SERIES,
];
static GET_CATE: [ParamInfo; 12] = [
    DIR, QUALITY, CODEC, IMAGE, SUBTITLE, DM, ONLY_AUDIO, NUM, ORDER, KEYWORD, DAYS, SERIES,
];
static GET_COLLECT: [ParamInfo; 7] = [DIR, QUALITY, CODEC, IMAGE, SUBTITLE, DM, ONLY_AUDIO];
static DIR_ONLY: [ParamInfo; 1] = [DIR];

static METHODS: [MethodInfo; 9] = [
    MethodInfo {
        name: "get_video",
        short: "v",
        help: "download one video page",
        params: &GET_VIDEO,
    },
    MethodInfo {
        name: "get_series",
        short: "s",
        help: "download every page of a multi-page video or an episode list",
        params: &GET_SERIES,
    },
    MethodInfo {
        name: "get_up",
        short: "up",
        help: "download an up's uploads (space URL or mid)",
        params: &GET_UP,
    },
    MethodInfo {
        name: "get_favour",
        short: "fav",
        help: "download a favourites folder (URL or fid)",
        params: &GET_FAVOUR,
    },
    MethodInfo {
        name: "get_cate",
        short: "cate",
        help: "download top videos of a sub-category by name",
        params: &GET_CATE,
    },
    MethodInfo {
        name: "get_collect_or_list",
        short: "col",
        help: "download a collection or a video list",
        params: &GET_COLLECT,
    },
    MethodInfo {
        name: "get_dm",
        short: "dm",
        help: "save the danmaku of a video",
        params: &DIR_ONLY,
    },
    MethodInfo {
        name: "get_subtitle",
        short: "sub",
        help: "save the subtitles of a video as SRT",
        params: &DIR_ONLY,
    },
    MethodInfo {
        name: "info",
        short: "i",
        help: "print the title, pages and streams of a video",
        params: &[],
    },
];

static INFO: HandlerInfo = HandlerInfo {
    tag: "bilibili",
    kind: HandlerKind::Site,
    pattern: Some(r"^https?://([A-Za-z0-9-]+\.)*(bilibili\.com|b23\.tv)"),
    help: "bilibili videos, series, up spaces, favourites, categories and collections",
    init: &INIT,
    methods: &METHODS,
};

/// Handler for bilibili keys.
#[derive(Clone, Default)]
pub struct BilibiliHandler {
    api: Option<Arc<dyn BilibiliApi>>,
}

impl std::fmt::Debug for BilibiliHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BilibiliHandler")
            .field("custom_api", &self.api.is_some())
            .finish()
    }
}

impl BilibiliHandler {
    /// Creates a handler scraping the public site.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handler using `api` instead of the web scraper.
    #[must_use]
    pub fn with_api(api: Arc<dyn BilibiliApi>) -> Self {
        Self { api: Some(api) }
    }
}

/// Which method a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Video,
    Series,
    Up,
    Favour,
    Cate,
    Collect,
    Danmaku,
    Subtitle,
    Info,
}

impl Method {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "get_video" => Self::Video,
            "get_series" => Self::Series,
            "get_up" => Self::Up,
            "get_favour" => Self::Favour,
            "get_cate" => Self::Cate,
            "get_collect_or_list" => Self::Collect,
            "get_dm" => Self::Danmaku,
            "get_subtitle" => Self::Subtitle,
            "info" => Self::Info,
            _ => return None,
        })
    }
}

impl Handler for BilibiliHandler {
    fn info(&self) -> &'static HandlerInfo {
        &INFO
    }

    fn matches(&self, keys: &[String]) -> bool {
        keys.iter().all(|key| PATTERN.is_match(key))
    }

    fn decide_handle(&self, method: &str, keys: &[String]) -> bool {
        matches!(method, "cate" | "get_cate")
            || (self.matches(keys) && INFO.method(method).is_some())
    }

    #[instrument(skip(self, init, options, context))]
    fn handle(
        &self,
        method: &str,
        keys: &[String],
        init: &OptionMap,
        options: &OptionMap,
        context: &HandlerContext,
    ) -> Result<Dispatched, DispatchError> {
        let Some((info, which)) = INFO
            .method(method)
            .and_then(|info| Method::from_name(info.name).map(|which| (info, which)))
        else {
            return Err(DispatchError::UnknownMethod {
                handler: INFO.tag,
                method: method.to_string(),
            });
        };

        let engine_options = EngineOptions::from_map(init)?;
        let video = VideoOptions::from_map(options, engine_options.hierarchy)?;
        let cookie = match (engine_options.cookie.as_deref(), Url::parse(WWW_BASE)) {
            (Some(value), Ok(url)) => Some(SiteCookie::sessdata(value, url)),
            _ => None,
        };
        let engine = context.engine(&engine_options, referer_headers(WWW_BASE), cookie)?;
        let api: Arc<dyn BilibiliApi> = match &self.api {
            Some(api) => Arc::clone(api),
            None => Arc::new(WebBilibiliApi::new(engine.client().clone())),
        };
        let job = Arc::new(BilibiliJob {
            api,
            orchestrator: MediaOrchestrator::new(engine),
            api_gate: Semaphore::new(engine_options.video_concurrency),
            cate_meta: OnceCell::new(),
            video,
        });

        let run = run_keys(keys, move |key| {
            let job = Arc::clone(&job);
            async move { job.run(which, &key).await }
        });
        Ok(Dispatched {
            handler: INFO.tag,
            method: info.name,
            run,
        })
    }
}

/// State shared by every key of one dispatched run.
struct BilibiliJob {
    api: Arc<dyn BilibiliApi>,
    orchestrator: MediaOrchestrator,
    api_gate: Semaphore,
    cate_meta: OnceCell<HashMap<String, CateInfo>>,
    video: VideoOptions,
}

impl BilibiliJob {
    async fn run(&self, method: Method, key: &str) -> Result<Vec<PathBuf>, MediaError> {
        let dir = self.video.dir.clone();
        match method {
            Method::Video => self.get_video(key, &dir, None).await,
            Method::Series => self.get_series(key, &dir).await,
            Method::Up => self.get_up(key, &dir).await,
            Method::Favour => self.get_favour(key, &dir).await,
            Method::Cate => self.get_cate(key, &dir).await,
            Method::Collect => self.get_collect_or_list(key, &dir).await,
            Method::Danmaku => self.get_dm(key, &dir).await,
            Method::Subtitle => self.get_subtitle(key, &dir).await,
            Method::Info => self.info(key).await,
        }
    }

    async fn video_info(&self, url: &str) -> Result<VideoInfo, MediaError> {
        let _permit = self
            .api_gate
            .acquire()
            .await
            .map_err(|_| DownloadError::unknown(url, "api gate closed"))?;
        Ok(self.api.get_video_info(url).await?)
    }

    async fn get_video(
        &self,
        url: &str,
        dir: &Path,
        info: Option<VideoInfo>,
    ) -> Result<Vec<PathBuf>, MediaError> {
        let info = match info {
            Some(info) => info,
            None => self.video_info(url).await?,
        };
        let mut descriptor = info.descriptor;
        if self.video.media.subtitle {
            match self.api.get_subtitle_tracks(&info.bvid, info.cid).await {
                Ok(tracks) => descriptor.streams.extend(tracks),
                Err(e) => warn!(url = %url, error = %e, "subtitle info unavailable"),
            }
        }
        self.orchestrator
            .get_media(&descriptor, dir, &self.video.media)
            .await
    }

    async fn get_series(&self, url: &str, dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
        let info = self.video_info(url).await?;
        let pages = info.descriptor.pages.clone();
        if pages.is_empty() {
            return self.get_video(url, dir, Some(info)).await;
        }
        let mut dir = dir.to_path_buf();
        if self.video.media.hierarchy && pages.len() > 1 {
            dir = dir.join(sanitize(&info.descriptor.title, None));
            create_dir(&dir).await?;
        }
        let selected = match self.video.p_range {
            Some(range) => page_slice(range, pages.len()),
            None => 0..pages.len(),
        };

        let current = info.page_index();
        let mut info = Some(info);
        let jobs: Vec<_> = pages[selected]
            .iter()
            .map(|page| {
                let reuse = if page.index == current { info.take() } else { None };
                let dir = dir.clone();
                async move { self.get_video(&page.url, &dir, reuse).await }
            })
            .collect();
        collect_results(join_all(jobs).await)
    }

    /// Downloads each `BV` id as a series or as a single video.
    async fn get_bvids(
        &self,
        bvids: &[String],
        dir: &Path,
        series: bool,
    ) -> Result<Vec<PathBuf>, MediaError> {
        let jobs: Vec<_> = bvids
            .iter()
            .map(|bvid| {
                let url = self.api.video_url(bvid);
                async move {
                    if series {
                        self.get_series(&url, dir).await
                    } else {
                        self.get_video(&url, dir, None).await
                    }
                }
            })
            .collect();
        collect_results(join_all(jobs).await)
    }

    async fn get_up(&self, key: &str, dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
        let mid = id_from_key(key, &MID_RE)?;
        let order = self.video.order_or(&UP_ORDERS);
        let keyword = &self.video.keyword;
        let first = self
            .api
            .get_up_page(&mid, 1, UP_PAGE_SIZE, order, keyword)
            .await?;
        let dir = self
            .listing_dir(dir, &format!("【up】{}", first.owner))
            .await?;

        let mut bvids = Vec::new();
        for (pn, take) in page_plan(first.total.min(self.video.num), UP_PAGE_SIZE) {
            let page = if pn == 1 {
                first.bvids.clone()
            } else {
                self.api
                    .get_up_page(&mid, pn, UP_PAGE_SIZE, order, keyword)
                    .await?
                    .bvids
            };
            bvids.extend(page.into_iter().take(take));
        }
        debug!(mid = %mid, count = bvids.len(), "up uploads listed");
        self.get_bvids(&bvids, &dir, self.video.series).await
    }

    async fn get_favour(&self, key: &str, dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
        let fid = id_from_key(key, &FID_RE)?;
        let keyword = &self.video.keyword;
        let first = self
            .api
            .get_favour_page(&fid, 1, FAVOUR_PAGE_SIZE, keyword)
            .await?;
        let dir = self
            .listing_dir(dir, &format!("【收藏夹】{}-{}", first.owner, first.name))
            .await?;

        let mut bvids = Vec::new();
        for (pn, take) in page_plan(first.total.min(self.video.num), FAVOUR_PAGE_SIZE) {
            let page = if pn == 1 {
                first.bvids.clone()
            } else {
                self.api
                    .get_favour_page(&fid, pn, FAVOUR_PAGE_SIZE, keyword)
                    .await?
                    .bvids
            };
            bvids.extend(page.into_iter().take(take));
        }
        self.get_bvids(&bvids, &dir, self.video.series).await
    }

    async fn get_cate(&self, name: &str, dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
        let meta = self
            .cate_meta
            .get_or_try_init(|| self.api.get_cate_meta())
            .await?;
        let Some(cate) = meta.get(name) else {
            return Err(ApiError::resource("category not found", name).into());
        };
        let tid = match (cate.is_sub, cate.tid) {
            (true, Some(tid)) => tid,
            _ => {
                return Err(ApiError::unsupported(format!(
                    "{name} is a main category; pick one of {:?}",
                    cate.subs
                ))
                .into());
            }
        };
        let dir = self.listing_dir(dir, &format!("【分区】{name}")).await?;

        let (time_from, time_to) = cate_window(Utc::now().date_naive(), self.video.days);
        let order = self.video.order_or(&CATE_ORDERS).to_string();

        let mut bvids = Vec::new();
        for (pn, take) in page_plan(self.video.num, CATE_PAGE_SIZE) {
            let query = CateQuery {
                tid,
                time_from: time_from.clone(),
                time_to: time_to.clone(),
                pn,
                ps: CATE_PAGE_SIZE,
                order: order.clone(),
                keyword: self.video.keyword.clone(),
            };
            let page = self.api.get_cate_page(&query).await?;
            bvids.extend(page.into_iter().take(take));
        }
        self.get_bvids(&bvids, &dir, self.video.series).await
    }

    async fn get_collect_or_list(&self, url: &str, dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
        let sid = id_from_key(url, &SID_RE)?;
        let (label, listing) = if url.contains("series") {
            ("【视频列表】", self.api.get_list_info(&sid).await?)
        } else if url.contains("collection") {
            ("【合集】", self.api.get_collect_info(&sid).await?)
        } else {
            return Err(ApiError::unsupported(format!(
                "{url} is neither a collection nor a video list"
            ))
            .into());
        };
        let name = sanitize(&format!("{label}{}", listing.owner), Some(&listing.name));
        let dir = self.listing_dir(dir, &name).await?;
        self.get_bvids(&listing.bvids, &dir, true).await
    }

    async fn get_dm(&self, url: &str, dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
        let info = self.video_info(url).await?;
        let (_, base_name) = media_names(&info.descriptor, self.video.media.hierarchy);
        create_dir(dir).await?;
        Ok(self
            .orchestrator
            .get_danmaku(&info.descriptor, dir, &base_name)
            .await?
            .into_iter()
            .collect())
    }

    async fn get_subtitle(&self, url: &str, dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
        let info = self.video_info(url).await?;
        let mut descriptor = info.descriptor;
        descriptor
            .streams
            .extend(self.api.get_subtitle_tracks(&info.bvid, info.cid).await?);
        let (_, base_name) = media_names(&descriptor, self.video.media.hierarchy);
        create_dir(dir).await?;
        self.orchestrator
            .get_subtitles(&descriptor, dir, &base_name)
            .await
    }

    async fn info(&self, url: &str) -> Result<Vec<PathBuf>, MediaError> {
        let info = self.video_info(url).await?;
        println!("{}", info.descriptor);
        Ok(Vec::new())
    }

    /// `dir/name` in hierarchy mode, else `dir`; created either way.
    async fn listing_dir(&self, dir: &Path, name: &str) -> Result<PathBuf, MediaError> {
        let dir = if self.video.media.hierarchy {
            dir.join(sanitize(name, None))
        } else {
            dir.to_path_buf()
        };
        create_dir(&dir).await?;
        Ok(dir)
    }
}

async fn create_dir(dir: &Path) -> Result<(), MediaError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DownloadError::io(dir, e).into())
}

/// Keeps the files of every child and fails with the first non-skippable
/// error once all children have finished.
fn collect_results(
    results: Vec<Result<Vec<PathBuf>, MediaError>>,
) -> Result<Vec<PathBuf>, MediaError> {
    let mut files = Vec::new();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(paths) => files.extend(paths),
            Err(e) if e.is_warning() => {}
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(files),
    }
}

/// The numeric id in `key`: the key itself, or the first capture of `re`
/// in a URL.
fn id_from_key(key: &str, re: &Regex) -> Result<String, MediaError> {
    if !key.starts_with("http") {
        return Ok(key.to_string());
    }
    re.captures(key)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ApiError::unsupported(format!("no id found in {key}")).into())
}

/// `(page number, items to take)` for the first `total` items of a listing
/// served `page_size` at a time.
fn page_plan(total: usize, page_size: usize) -> Vec<(usize, usize)> {
    if page_size == 0 {
        return Vec::new();
    }
    (0..total.div_ceil(page_size))
        .map(|i| (i + 1, (total - i * page_size).min(page_size)))
        .collect()
}

/// `(from, to)` as `YYYYMMDD` stamps for a listing of the last `days` days
/// ending `today`.
fn cate_window(today: NaiveDate, days: u32) -> (String, String) {
    let from = today
        .checked_sub_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MIN);
    (
        from.format(DATE_STAMP).to_string(),
        today.format(DATE_STAMP).to_string(),
    )
}

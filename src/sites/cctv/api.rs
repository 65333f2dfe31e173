//! tv.cctv.com scrapers.

use std::sync::LazyLock;

use async_trait::async_trait;
use m3u8_rs::Playlist;
use regex::Regex;
use serde::Deserialize;

use super::super::{compile_static_regex, decode_json};
use crate::download::{HttpClient, resolve_uri};
use crate::media::ApiError;

/// Video info API host.
pub const VDN_BASE: &str = "https://vdn.apps.cntv.cn";
/// Album API host.
pub const ALBUM_BASE: &str = "https://api.cntv.cn";

static GUID_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r#"guid ?= ?"(\w+)""#));
static VIDE_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"/(VIDE\w+)\."));
static VIDA_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"videotvCodes ?= ?"(\w+)""#));
static VARIANT_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"/(\d+)\.m3u8"));

/// Ids scraped from a video page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CctvIds {
    /// Media id used by the info API.
    pub pid: String,
    /// Video id from the page URL.
    pub vide: Option<String>,
    /// Album id; present when the video belongs to a series.
    pub vida: Option<String>,
}

/// Scraper contract for tv.cctv.com.
#[async_trait]
pub trait CctvApi: Send + Sync {
    /// Scrapes the ids of a video page.
    async fn get_id(&self, url: &str) -> Result<CctvIds, ApiError>;

    /// Title and variant playlist URLs of `pid`, best quality first.
    async fn get_media_info(&self, pid: &str) -> Result<(String, Vec<String>), ApiError>;

    /// Album title and the `pid` of every episode.
    async fn get_series_info(&self, vide: &str, vida: &str)
    -> Result<(String, Vec<String>), ApiError>;
}

/// Extracts [`CctvIds`] from a page and its URL.
///
/// # Errors
///
/// Returns [`ApiError::Unsupported`] when the page carries no `guid`.
pub fn parse_ids(html: &str, url: &str) -> Result<CctvIds, ApiError> {
    let pid = GUID_RE
        .captures(html)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| ApiError::unsupported(format!("no guid found at {url}")))?;
    Ok(CctvIds {
        pid,
        vide: VIDE_RE.captures(url).map(|caps| caps[1].to_string()),
        vida: VIDA_RE.captures(html).map(|caps| caps[1].to_string()),
    })
}

/// Variant URLs of a master playlist ordered by the number in their file
/// name, highest first. A media playlist yields `playlist_url` itself.
///
/// # Errors
///
/// Returns [`ApiError::Unsupported`] when the playlist cannot be parsed.
pub fn rank_variants(playlist_url: &str, body: &[u8]) -> Result<Vec<String>, ApiError> {
    let playlist = m3u8_rs::parse_playlist_res(body)
        .map_err(|_| ApiError::unsupported(format!("malformed playlist at {playlist_url}")))?;
    let Playlist::MasterPlaylist(master) = playlist else {
        return Ok(vec![playlist_url.to_string()]);
    };
    let mut variants = master
        .variants
        .iter()
        .map(|variant| resolve_uri(playlist_url, &variant.uri))
        .collect::<Result<Vec<_>, _>>()?;
    let rank = |url: &String| -> u64 {
        VARIANT_NUMBER_RE
            .captures(url)
            .and_then(|caps| caps[1].parse().ok())
            .unwrap_or(0)
    };
    variants.sort_by_key(|url| std::cmp::Reverse(rank(url)));
    Ok(variants)
}

#[derive(Debug, Deserialize)]
struct VideoInfoResponse {
    title: String,
    hls_url: String,
}

#[derive(Debug, Deserialize)]
struct AlbumResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct AlbumMeta {
    title: String,
}

#[derive(Debug, Deserialize)]
struct AlbumList {
    #[serde(default)]
    list: Vec<AlbumItem>,
}

#[derive(Debug, Deserialize)]
struct AlbumItem {
    guid: String,
}

/// Page and API scraper over HTTP.
#[derive(Debug, Clone)]
pub struct WebCctvApi {
    client: HttpClient,
    vdn_base: String,
    album_base: String,
}

impl WebCctvApi {
    /// Creates a scraper against the public hosts.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            vdn_base: VDN_BASE.to_string(),
            album_base: ALBUM_BASE.to_string(),
        }
    }

    /// Creates a scraper with both API hosts pointed at `base` (for tests).
    #[must_use]
    pub fn with_base_url(client: HttpClient, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            client,
            vdn_base: base.to_string(),
            album_base: base.to_string(),
        }
    }
}

#[async_trait]
impl CctvApi for WebCctvApi {
    #[tracing::instrument(skip(self))]
    async fn get_id(&self, url: &str) -> Result<CctvIds, ApiError> {
        let html = self.client.get_text(url).await?;
        parse_ids(&html, url)
    }

    async fn get_media_info(&self, pid: &str) -> Result<(String, Vec<String>), ApiError> {
        let url = format!("{}/api/getHttpVideoInfo.do?pid={pid}", self.vdn_base);
        let body = self.client.get_text(&url).await?;
        let info: VideoInfoResponse = decode_json("video info", &body)?;
        let playlist = self.client.get_bytes(&info.hls_url).await?;
        let variants = rank_variants(&info.hls_url, &playlist)?;
        if variants.is_empty() {
            return Err(ApiError::resource("no playable variant", pid));
        }
        Ok((info.title, variants))
    }

    async fn get_series_info(
        &self,
        vide: &str,
        vida: &str,
    ) -> Result<(String, Vec<String>), ApiError> {
        let meta_url = format!(
            "{}/NewVideoset/getVideoAlbumInfoByVideoId?id={vide}&serviceId=tvcctv",
            self.album_base
        );
        let list_url = format!(
            "{}/NewVideo/getVideoListByAlbumIdNew?mode=0&id={vida}&serviceId=tvcctv&p=1&n=999",
            self.album_base
        );
        let (meta, list) =
            futures_util::future::join(self.client.get_text(&meta_url), self.client.get_text(&list_url))
                .await;
        let meta: AlbumResponse<AlbumMeta> = decode_json("album info", &meta?)?;
        let list: AlbumResponse<AlbumList> = decode_json("album list", &list?)?;
        Ok((
            meta.data.title,
            list.data.list.into_iter().map(|item| item.guid).collect(),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ids() {
        let html = r#"<script>var guid = "a1b2c3"; var videotvCodes="VIDAxyz";</script>"#;
        let ids = parse_ids(html, "https://tv.cctv.com/2012/05/02/VIDE1355968282695723.shtml?spm=1")
            .unwrap();
        assert_eq!(ids.pid, "a1b2c3");
        assert_eq!(ids.vide.as_deref(), Some("VIDE1355968282695723"));
        assert_eq!(ids.vida.as_deref(), Some("VIDAxyz"));

        let ids = parse_ids(r#"guid="p1""#, "https://tv.cctv.com/x.shtml").unwrap();
        assert!(ids.vide.is_none() && ids.vida.is_none());
        assert!(parse_ids("", "https://tv.cctv.com").is_err());
    }

    #[test]
    fn test_rank_variants_orders_by_number() {
        let master = b"#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=460800\n/asp/hls/450/0303000a/3/default/abc/450.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2048000\n/asp/hls/2000/0303000a/3/default/abc/2000.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=870400\n/asp/hls/850/0303000a/3/default/abc/850.m3u8\n";
        let ranked = rank_variants("https://hls.cntv.cdn/asp/hls/main/abc/main.m3u8", master).unwrap();
        assert_eq!(ranked.len(), 3);
        assert!(ranked[0].ends_with("/2000.m3u8"));
        assert!(ranked[0].starts_with("https://hls.cntv.cdn/"));
        assert!(ranked[2].ends_with("/450.m3u8"));
    }

    #[test]
    fn test_rank_variants_media_playlist() {
        let media = b"#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10,\n0.ts\n#EXT-X-ENDLIST\n";
        assert_eq!(
            rank_variants("https://h/x.m3u8", media).unwrap(),
            ["https://h/x.m3u8"]
        );
    }
}

//! tv.cctv.com handler.

mod api;

pub use api::{ALBUM_BASE, CctvApi, CctvIds, VDN_BASE, WebCctvApi, parse_ids, rank_variants};

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use futures_util::future::join_all;
use regex::Regex;
use tracing::{debug, instrument};

use super::{
    DIR, HIERARCHY, MAX_CON, PART_CON, QUALITY, SPEED_LIMIT, STREAM_RETRY, TIME_RANGE,
    compile_static_regex, referer_headers,
};
use crate::dispatch::{
    DispatchError, Dispatched, EngineOptions, Handler, HandlerContext, HandlerInfo, HandlerKind,
    MethodInfo, OptionMap, ParamInfo, VideoOptions, run_keys,
};
use crate::download::{DownloadError, sanitize};
use crate::media::{MediaDescriptor, MediaError, MediaOrchestrator, Quality};

const SITE_URL: &str = "https://tv.cctv.com";

static PATTERN: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"^https?://([A-Za-z0-9-]+\.)*(cctv\.com|cntv\.cn)"));

static INIT: [ParamInfo; 5] = [MAX_CON, PART_CON, SPEED_LIMIT, STREAM_RETRY, HIERARCHY];
static GET_VIDEO: [ParamInfo; 3] = [DIR, QUALITY, TIME_RANGE];
static GET_SERIES: [ParamInfo; 2] = [DIR, QUALITY];
static METHODS: [MethodInfo; 2] = [
    MethodInfo {
        name: "get_video",
        short: "v",
        help: "download one video (page URL or pid)",
        params: &GET_VIDEO,
    },
    MethodInfo {
        name: "get_series",
        short: "s",
        help: "download every episode of the album a video belongs to",
        params: &GET_SERIES,
    },
];

static INFO: HandlerInfo = HandlerInfo {
    tag: "cctv",
    kind: HandlerKind::Site,
    pattern: Some(r"^https?://([A-Za-z0-9-]+\.)*(cctv\.com|cntv\.cn)"),
    help: "tv.cctv.com videos and series",
    init: &INIT,
    methods: &METHODS,
};

/// Handler for tv.cctv.com keys.
#[derive(Clone, Default)]
pub struct CctvHandler {
    api: Option<Arc<dyn CctvApi>>,
}

impl std::fmt::Debug for CctvHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CctvHandler")
            .field("custom_api", &self.api.is_some())
            .finish()
    }
}

impl CctvHandler {
    /// Creates a handler scraping the public site.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handler using `api` instead of the web scraper.
    #[must_use]
    pub fn with_api(api: Arc<dyn CctvApi>) -> Self {
        Self { api: Some(api) }
    }
}

impl Handler for CctvHandler {
    fn info(&self) -> &'static HandlerInfo {
        &INFO
    }

    fn matches(&self, keys: &[String]) -> bool {
        keys.iter().all(|key| PATTERN.is_match(key))
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
        let Some(info) = INFO.method(method) else {
            return Err(DispatchError::UnknownMethod {
                handler: INFO.tag,
                method: method.to_string(),
            });
        };
        let series = info.name == "get_series";

        let engine_options = EngineOptions::from_map(init)?;
        let video = VideoOptions::from_map(options, engine_options.hierarchy)?;
        let engine = context.engine(&engine_options, referer_headers(SITE_URL), None)?;
        let api: Arc<dyn CctvApi> = match &self.api {
            Some(api) => Arc::clone(api),
            None => Arc::new(WebCctvApi::new(engine.client().clone())),
        };
        let job = Arc::new(CctvJob {
            api,
            orchestrator: MediaOrchestrator::new(engine),
            video,
        });

        let run = run_keys(keys, move |key| {
            let job = Arc::clone(&job);
            async move {
                let dir = job.video.dir.clone();
                if series {
                    job.get_series(&key, &dir).await
                } else {
                    job.get_video(&key, &dir).await
                }
            }
        });
        Ok(Dispatched {
            handler: INFO.tag,
            method: info.name,
            run,
        })
    }
}

struct CctvJob {
    api: Arc<dyn CctvApi>,
    orchestrator: MediaOrchestrator,
    video: VideoOptions,
}

impl CctvJob {
    async fn get_video(&self, url_or_pid: &str, dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
        let pid = if url_or_pid.starts_with("http") {
            self.api.get_id(url_or_pid).await?.pid
        } else {
            url_or_pid.to_string()
        };
        let (title, variants) = self.api.get_media_info(&pid).await?;
        let index = match &self.video.media.quality {
            Quality::Index(index) => (*index).min(variants.len().saturating_sub(1)),
            Quality::Label(label) => {
                debug!(label = %label, "quality labels are not offered here, using the best");
                0
            }
        };
        let descriptor = MediaDescriptor {
            title,
            hls_url: variants.get(index).cloned(),
            source_url: url_or_pid.to_string(),
            ..MediaDescriptor::default()
        };
        self.orchestrator
            .get_media(&descriptor, dir, &self.video.media)
            .await
    }

    async fn get_series(&self, url: &str, dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
        let ids = self.api.get_id(url).await?;
        let (Some(vide), Some(vida)) = (ids.vide.as_deref(), ids.vida.as_deref()) else {
            return self.get_video(&ids.pid, dir).await;
        };
        let (title, pids) = self.api.get_series_info(vide, vida).await?;
        let dir = if self.video.media.hierarchy {
            let dir = dir.join(sanitize(&title, None));
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| DownloadError::io(&dir, e))?;
            dir
        } else {
            dir.to_path_buf()
        };

        let results = join_all(pids.iter().map(|pid| self.get_video(pid, &dir))).await;
        let mut files = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(paths) => files.extend(paths),
                Err(e) if e.is_warning() => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(files), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern() {
        let handler = CctvHandler::new();
        let key = |k: &str| vec![k.to_string()];
        assert!(handler.matches(&key("https://tv.cctv.com/2012/05/02/VIDE1.shtml")));
        assert!(handler.matches(&key("https://vdn.apps.cntv.cn/api")));
        assert!(!handler.matches(&key("https://www.bilibili.com/video/BV1")));
        assert!(handler.decide_handle("s", &key("https://tv.cctv.com/x")));
        assert!(!handler.decide_handle("up", &key("https://tv.cctv.com/x")));
    }
}

//! HLS playlist handler.

use reqwest::header::HeaderMap;
use tracing::instrument;

use super::{DIR, MAX_CON, PART_CON, SPEED_LIMIT, STREAM_RETRY, TIME_RANGE};
use crate::dispatch::{
    DispatchError, Dispatched, EngineOptions, Handler, HandlerContext, HandlerInfo, HandlerKind,
    MethodInfo, OptionMap, ParamInfo, VideoOptions, run_keys,
};
use crate::media::MediaError;

static INIT: [ParamInfo; 4] = [MAX_CON, PART_CON, SPEED_LIMIT, STREAM_RETRY];
static GET_M3U8_VIDEO: [ParamInfo; 2] = [DIR, TIME_RANGE];
static METHODS: [MethodInfo; 1] = [MethodInfo {
    name: "get_m3u8_video",
    short: "m3u8",
    help: "download the segments of an m3u8 playlist into one file",
    params: &GET_M3U8_VIDEO,
}];

static INFO: HandlerInfo = HandlerInfo {
    tag: "m3u8",
    kind: HandlerKind::Base,
    pattern: None,
    help: "HLS playlist URLs",
    init: &INIT,
    methods: &METHODS,
};

/// Downloads media or master playlists.
#[derive(Debug, Clone, Copy, Default)]
pub struct M3u8Handler;

impl Handler for M3u8Handler {
    fn info(&self) -> &'static HandlerInfo {
        &INFO
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
        let Some(method) = INFO.method(method) else {
            return Err(DispatchError::UnknownMethod {
                handler: INFO.tag,
                method: method.to_string(),
            });
        };
        let engine_options = EngineOptions::from_map(init)?;
        let video = VideoOptions::from_map(options, engine_options.hierarchy)?;
        let engine = context.engine(&engine_options, HeaderMap::new(), None)?;
        let time_range = video.time_range();
        let dir = video.dir;

        let run = run_keys(keys, move |key| {
            let engine = engine.clone();
            let dir = dir.clone();
            async move {
                let path = engine.get_m3u8_video(&key, &dir, time_range, None).await?;
                Ok::<_, MediaError>(vec![path])
            }
        });
        Ok(Dispatched {
            handler: INFO.tag,
            method: method.name,
            run,
        })
    }
}

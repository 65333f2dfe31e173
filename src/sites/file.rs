//! Direct file handler.

use reqwest::header::HeaderMap;
use tracing::instrument;

use super::{DIR, PART_CON, SPEED_LIMIT, STREAM_RETRY};
use crate::dispatch::{
    DispatchError, Dispatched, EngineOptions, Handler, HandlerContext, HandlerInfo, HandlerKind,
    MethodInfo, OptionMap, ParamInfo, VideoOptions, run_keys,
};
use crate::media::MediaError;

static INIT: [ParamInfo; 3] = [PART_CON, SPEED_LIMIT, STREAM_RETRY];
static GET_FILE: [ParamInfo; 1] = [DIR];
static METHODS: [MethodInfo; 1] = [MethodInfo {
    name: "get_file",
    short: "f",
    help: "download files by URL as concurrent byte ranges",
    params: &GET_FILE,
}];

static INFO: HandlerInfo = HandlerInfo {
    tag: "file",
    kind: HandlerKind::Base,
    pattern: None,
    help: "direct file URLs",
    init: &INIT,
    methods: &METHODS,
};

/// Downloads any URL that answers range requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileHandler;

impl Handler for FileHandler {
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
        let dir = VideoOptions::from_map(options, engine_options.hierarchy)?.dir;
        let engine = context.engine(&engine_options, HeaderMap::new(), None)?;

        let run = run_keys(keys, move |key| {
            let engine = engine.clone();
            let dir = dir.clone();
            async move {
                let path = engine.get_file(&[key], &dir, None).await?;
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

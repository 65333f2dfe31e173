//! Handler registry and request routing.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument};

use super::options::{OptionMap, filter_options};
use super::{DispatchError, Dispatched, Handler, HandlerContext, HandlerInfo, HandlerKind};

#[allow(clippy::expect_used)]
static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:[\w-]*\.)?([\w-]+)\.([\w-]+)").expect("domain regex is valid")
});

/// The part of a key compared against site tags: the second-level domain
/// for URLs, the key itself otherwise.
///
/// ```
/// use mediadl_core::dispatch::compare_key;
///
/// assert_eq!(compare_key("https://www.bilibili.com/video/BV1"), "bilibili");
/// assert_eq!(compare_key("https://tv.cctv.com/2023/x.shtml"), "cctv");
/// assert_eq!(compare_key("BV1xx"), "BV1xx");
/// ```
#[must_use]
pub fn compare_key(key: &str) -> &str {
    DOMAIN_RE
        .captures(key)
        .and_then(|caps| caps.get(1))
        .map_or(key, |m| m.as_str())
}

/// Length in characters of the longest common substring of `a` and `b`.
#[must_use]
pub fn longest_common_len(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous = vec![0usize; b.len() + 1];
    let mut best = 0;
    for ca in &a {
        let mut current = vec![0usize; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            if ca == cb {
                current[j + 1] = previous[j] + 1;
                best = best.max(current[j + 1]);
            }
        }
        previous = current;
    }
    best
}

/// Routes method calls to registered handlers.
pub struct Dispatcher {
    handlers: Vec<Box<dyn Handler>>,
    context: HandlerContext,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field(
                "handlers",
                &self.handlers.iter().map(|h| h.info().tag).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new(context: HandlerContext) -> Self {
        Self {
            handlers: Vec::new(),
            context,
        }
    }

    /// Creates a dispatcher with the shipped handlers registered.
    #[must_use]
    pub fn with_default_handlers(context: HandlerContext) -> Self {
        let mut dispatcher = Self::new(context);
        for handler in crate::sites::default_handlers() {
            dispatcher.register(handler);
        }
        dispatcher
    }

    /// Registers a handler. Base handlers are kept ahead of site handlers;
    /// ties in ordering fall back to registration order.
    pub fn register(&mut self, handler: Box<dyn Handler>) {
        debug!(tag = handler.info().tag, kind = ?handler.info().kind, "registered handler");
        if handler.info().kind == HandlerKind::Base {
            let at = self
                .handlers
                .iter()
                .position(|h| h.info().kind == HandlerKind::Site)
                .unwrap_or(self.handlers.len());
            self.handlers.insert(at, handler);
        } else {
            self.handlers.push(handler);
        }
    }

    /// Metadata of every registered handler.
    pub fn infos(&self) -> impl Iterator<Item = &'static HandlerInfo> + '_ {
        self.handlers.iter().map(|h| h.info())
    }

    /// Metadata of the handler tagged `tag`.
    #[must_use]
    pub fn info(&self, tag: &str) -> Option<&'static HandlerInfo> {
        self.infos().find(|info| info.tag == tag)
    }

    /// Registered handlers in the order they are asked for `method` and
    /// `keys`.
    #[must_use]
    pub fn candidates(&self, method: &str, keys: &[String]) -> Vec<&dyn Handler> {
        let site_key = keys.first().map_or("", |key| compare_key(key));
        let mut ordered: Vec<&dyn Handler> = self.handlers.iter().map(AsRef::as_ref).collect();
        ordered.sort_by_cached_key(|handler| {
            let info = handler.info();
            let against = match info.kind {
                HandlerKind::Base => method,
                HandlerKind::Site => site_key,
            };
            std::cmp::Reverse(longest_common_len(against, info.tag))
        });
        ordered
    }

    /// Binds `method` and `keys` to the first accepting handler.
    ///
    /// `options` holds every option the user gave; each handler only sees
    /// the ones its schema declares.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownMethod`] when a site handler matched
    /// the keys but does not offer `method`, [`DispatchError::NoHandler`]
    /// when nothing matched, or the chosen handler's error.
    #[instrument(skip(self, options))]
    pub fn dispatch(
        &self,
        method: &str,
        keys: &[String],
        options: &OptionMap,
    ) -> Result<Dispatched, DispatchError> {
        if keys.is_empty() {
            return Err(DispatchError::NoHandler {
                method: method.to_string(),
                keys: Vec::new(),
            });
        }

        let mut unknown_method = None;
        for handler in self.candidates(method, keys) {
            let info = handler.info();
            if handler.decide_handle(method, keys) {
                let Some(method_info) = info.method(method) else {
                    continue;
                };
                debug!(handler = info.tag, method = method_info.name, "assigned handler");
                let init = filter_options(info.init, options);
                let method_options = filter_options(method_info.params, options);
                return handler.handle(method, keys, &init, &method_options, &self.context);
            }
            if info.kind == HandlerKind::Site && handler.matches(keys) && unknown_method.is_none() {
                unknown_method = Some(DispatchError::UnknownMethod {
                    handler: info.tag,
                    method: method.to_string(),
                });
            }
        }

        Err(unknown_method.unwrap_or_else(|| DispatchError::NoHandler {
            method: method.to_string(),
            keys: keys.to_vec(),
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dispatch::options::{OptionValue, ParamInfo, ParamKind};
    use crate::dispatch::{MethodInfo, RunReport};
    use crate::ffmpeg::Ffmpeg;
    use crate::progress::ProgressSurface;
    use futures_util::FutureExt;
    use std::sync::{Arc, Mutex};

    static PARAMS: [ParamInfo; 1] = [ParamInfo::new("dir", ParamKind::Text, ".", "")];
    static INIT: [ParamInfo; 1] = [ParamInfo::new("max_con", ParamKind::Int, "3", "")];

    static BASE_METHODS: [MethodInfo; 1] = [MethodInfo {
        name: "get_file",
        short: "f",
        help: "",
        params: &PARAMS,
    }];
    static SITE_METHODS: [MethodInfo; 1] = [MethodInfo {
        name: "get_video",
        short: "v",
        help: "",
        params: &PARAMS,
    }];

    static FILE_INFO: HandlerInfo = HandlerInfo {
        tag: "file",
        kind: HandlerKind::Base,
        pattern: None,
        help: "",
        init: &INIT,
        methods: &BASE_METHODS,
    };
    static SITE_INFO: HandlerInfo = HandlerInfo {
        tag: "bilibili",
        kind: HandlerKind::Site,
        pattern: Some("bilibili.com"),
        help: "",
        init: &INIT,
        methods: &SITE_METHODS,
    };

    type Seen = Arc<Mutex<Vec<(OptionMap, OptionMap)>>>;

    struct FakeHandler {
        info: &'static HandlerInfo,
        seen: Seen,
    }

    impl Handler for FakeHandler {
        fn info(&self) -> &'static HandlerInfo {
            self.info
        }

        fn matches(&self, keys: &[String]) -> bool {
            self.info
                .pattern
                .is_none_or(|pattern| keys.iter().all(|k| k.contains(pattern)))
        }

        fn handle(
            &self,
            method: &str,
            _keys: &[String],
            init: &OptionMap,
            options: &OptionMap,
            _context: &HandlerContext,
        ) -> Result<Dispatched, DispatchError> {
            self.seen
                .lock()
                .unwrap()
                .push((init.clone(), options.clone()));
            Ok(Dispatched {
                handler: self.info.tag,
                method: self.info.method(method).unwrap().name,
                run: async { RunReport::default() }.boxed(),
            })
        }
    }

    fn dispatcher() -> (Dispatcher, Seen) {
        let seen: Seen = Arc::default();
        let context = HandlerContext::new(
            Arc::new(ProgressSurface::hidden()),
            Arc::new(Ffmpeg::default()),
        );
        let mut dispatcher = Dispatcher::new(context);
        dispatcher.register(Box::new(FakeHandler {
            info: &SITE_INFO,
            seen: Arc::clone(&seen),
        }));
        dispatcher.register(Box::new(FakeHandler {
            info: &FILE_INFO,
            seen: Arc::clone(&seen),
        }));
        (dispatcher, seen)
    }

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_longest_common_len() {
        assert_eq!(longest_common_len("bilibili", "bilibili"), 8);
        assert_eq!(longest_common_len("get_m3u8_video", "m3u8"), 4);
        assert_eq!(longest_common_len("v", "file"), 0);
        assert_eq!(longest_common_len("", "file"), 0);
    }

    #[test]
    fn test_site_handler_ranks_first_for_its_domain() {
        let (dispatcher, _) = dispatcher();
        let order: Vec<_> = dispatcher
            .candidates("v", &keys(&["https://www.bilibili.com/video/BV1"]))
            .iter()
            .map(|h| h.info().tag)
            .collect();
        assert_eq!(order, ["bilibili", "file"]);

        let order: Vec<_> = dispatcher
            .candidates("f", &keys(&["https://example.com/a.zip"]))
            .iter()
            .map(|h| h.info().tag)
            .collect();
        assert_eq!(order, ["file", "bilibili"]);
    }

    #[test]
    fn test_dispatch_filters_options_per_schema() {
        let (dispatcher, seen) = dispatcher();
        let mut options = OptionMap::new();
        options.insert("dir".into(), OptionValue::Text("/tmp".into()));
        options.insert("max_con".into(), OptionValue::Int(2));
        options.insert("image".into(), OptionValue::Flag(true));

        let dispatched = dispatcher
            .dispatch("v", &keys(&["https://www.bilibili.com/video/BV1"]), &options)
            .unwrap();
        assert_eq!(dispatched.handler, "bilibili");
        assert_eq!(dispatched.method, "get_video");

        let seen = seen.lock().unwrap();
        let (init, method) = &seen[0];
        assert_eq!(init.keys().collect::<Vec<_>>(), ["max_con"]);
        assert_eq!(method.keys().collect::<Vec<_>>(), ["dir"]);
    }

    #[test]
    fn test_unknown_method_on_matching_site() {
        let (dispatcher, _) = dispatcher();
        let err = dispatcher
            .dispatch("up", &keys(&["https://www.bilibili.com/video/BV1"]), &OptionMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::UnknownMethod { handler: "bilibili", .. }
        ));
    }

    #[test]
    fn test_no_handler() {
        let (dispatcher, _) = dispatcher();
        let err = dispatcher
            .dispatch("v", &keys(&["https://example.com/x"]), &OptionMap::new())
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoHandler { .. }));
        let err = dispatcher.dispatch("f", &[], &OptionMap::new()).unwrap_err();
        assert!(matches!(err, DispatchError::NoHandler { .. }));
    }

    #[test]
    fn test_dispatch_is_idempotent() {
        let (dispatcher, _) = dispatcher();
        let keys = keys(&["https://example.com/a.zip"]);
        let first = dispatcher.dispatch("f", &keys, &OptionMap::new()).unwrap();
        let second = dispatcher.dispatch("f", &keys, &OptionMap::new()).unwrap();
        assert_eq!(
            (first.handler, first.method),
            (second.handler, second.method)
        );
    }
}

//! Dispatch error types.

use thiserror::Error;

use crate::download::EngineError;

/// Errors raised before any download starts.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler accepts the method and keys.
    #[error("no handler for method '{method}' with keys {keys:?}")]
    NoHandler {
        /// Requested method.
        method: String,
        /// Requested keys.
        keys: Vec<String>,
    },

    /// A handler matched the keys but does not offer the method.
    #[error("method '{method}' is not available for {handler}")]
    UnknownMethod {
        /// Handler tag.
        handler: &'static str,
        /// Requested method.
        method: String,
    },

    /// An option value is invalid for the handler.
    #[error("invalid option --{name}: {message}")]
    InvalidOption {
        /// Option name.
        name: String,
        /// What is wrong with it.
        message: String,
    },

    /// The download engine could not be built.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl DispatchError {
    /// Creates an invalid option error.
    pub fn invalid_option(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            name: name.into(),
            message: message.into(),
        }
    }
}

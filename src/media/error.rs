//! Error types for scrapers and media jobs.

use thiserror::Error;

use crate::download::DownloadError;

/// Errors raised by site scrapers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The site reports the resource as unavailable (deleted, region-locked,
    /// membership-only).
    #[error("{message}: {resource}")]
    Resource {
        /// What went wrong.
        message: String,
        /// URL or id of the resource.
        resource: String,
    },

    /// The page layout or resource type is not supported.
    #[error("unsupported: {message}")]
    Unsupported {
        /// What is unsupported.
        message: String,
    },

    /// A JSON payload could not be decoded.
    #[error("cannot parse {context}: {source}")]
    Parse {
        /// Which payload failed.
        context: String,
        /// The decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// The request itself failed.
    #[error(transparent)]
    Request(#[from] DownloadError),
}

impl ApiError {
    /// Creates a resource error.
    pub fn resource(message: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
            resource: resource.into(),
        }
    }

    /// Creates an unsupported error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Creates a parse error.
    pub fn parse(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Parse {
            context: context.into(),
            source,
        }
    }

    /// Resource and unsupported errors skip the item with a warning.
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Resource { .. } | Self::Unsupported { .. })
    }
}

/// Errors from one media job.
#[derive(Debug, Error)]
pub enum MediaError {
    /// A download failed.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The scraper failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The requested quality or codec is not offered.
    #[error("{title}: quality <{quality}> codec <{codec}> is not available")]
    NoMatchingQuality {
        /// Display title of the media.
        title: String,
        /// Requested quality.
        quality: String,
        /// Requested codec choice.
        codec: String,
    },
}

impl MediaError {
    /// True for failures reported as warnings (skipped item) rather than
    /// errors.
    #[must_use]
    pub fn is_warning(&self) -> bool {
        match self {
            Self::NoMatchingQuality { .. } => true,
            Self::Api(api) => api.is_skippable(),
            Self::Download(_) => false,
        }
    }

    /// The download error, if this failure is one.
    #[must_use]
    pub fn as_download(&self) -> Option<&DownloadError> {
        match self {
            Self::Download(error) | Self::Api(ApiError::Request(error)) => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_classification() {
        let quality = MediaError::NoMatchingQuality {
            title: "t".to_string(),
            quality: "1080P".to_string(),
            codec: "hev:".to_string(),
        };
        assert!(quality.is_warning());
        assert!(quality.to_string().contains("<1080P>"));

        let api = MediaError::Api(ApiError::resource("video is gone", "BV1xx"));
        assert!(api.is_warning());

        let exhausted = MediaError::Download(DownloadError::PartRetryExceeded {
            part: "a-0-9".to_string(),
            attempts: 6,
        });
        assert!(!exhausted.is_warning());
        assert!(exhausted.as_download().is_some());
    }
}

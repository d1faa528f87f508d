//! Error types for fetchdriver.

use std::fmt;
use std::time::Duration;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by [`fetch`][crate::Client::fetch] and the connection layer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request's abort signal fired, before or during the request.
    #[error("the operation was aborted")]
    Abort,

    /// The request deadline was exceeded, including during TLS connect.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid configuration or request, such as an unrecognized URL scheme.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Internal signal telling the orchestrator to retry the whole fetch.
    ///
    /// Consumed by the retry loop and never returned to callers unless the
    /// attempt cap is exhausted.
    #[error("request obsoleted by a connection race, retry")]
    Retry,

    /// The redirect chain revisited a URL it had already fetched.
    #[error("redirect loop detected: {chain}")]
    RedirectLoop {
        /// The offending URL subsequence, oldest first.
        chain: String,
    },

    /// A 3xx response carried no `Location` header while following redirects.
    #[error("redirect response without a location header")]
    MissingLocation,

    /// Only GET and HEAD requests may be redirected; the body cannot be
    /// replayed for other methods.
    #[error("unsupported redirect of a {0} request")]
    UnsupportedRedirect(http::Method),

    /// A redirect was answered while the request's redirect mode was `Error`.
    #[error("redirect received with redirect mode set to error")]
    RedirectNotAllowed,

    /// The connection or pool backing this request was disconnected.
    #[error("connection disconnected")]
    Disconnected,

    /// HTTP/1 upgrades are not supported by this client.
    #[error("http/1 connection upgrades are not supported")]
    UpgradeNotSupported,

    /// TLS setup or handshake failure.
    #[error("tls: {0}")]
    Tls(String),

    /// Content decoding failed.
    #[error("decode ({encoding}): {message}")]
    Decode {
        /// The content-encoding that failed to decode.
        encoding: String,
        /// Decoder error detail.
        message: String,
    },

    /// Underlying socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// HTTP/1 protocol error from hyper.
    #[error("http/1: {0}")]
    Http1(#[from] hyper::Error),

    /// HTTP/2 protocol error from h2.
    #[error("http/2: {0}")]
    Http2(#[from] h2::Error),

    /// Request construction error.
    #[error(transparent)]
    Http(#[from] http::Error),
}

impl Error {
    /// True for the internal retry signal.
    pub(crate) fn is_retry(&self) -> bool {
        matches!(self, Error::Retry)
    }

    pub(crate) fn fetch(message: impl Into<String>) -> Self {
        Error::Fetch(message.into())
    }

    /// Classify a boxed body-stream error back into the taxonomy.
    pub(crate) fn from_body(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        match err.downcast::<hyper::Error>() {
            Ok(err) => Error::Http1(*err),
            Err(err) => match err.downcast::<h2::Error>() {
                Ok(err) => Error::Http2(*err),
                Err(err) => Error::Fetch(err.to_string()),
            },
        }
    }

    pub(crate) fn decode(encoding: impl Into<String>, err: impl fmt::Display) -> Self {
        Error::Decode {
            encoding: encoding.into(),
            message: err.to_string(),
        }
    }
}

//! Responses returned from [`fetch`][crate::Client::fetch].

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Uri, Version};
use http_body_util::BodyExt;

use crate::body::Body;
use crate::decode::DecoderSet;
use crate::error::{Error, Result};

/// An HTTP response.
///
/// The body streams; [`collect`][Response::collect] buffers it, applies the
/// content-encoding decoders, and surfaces any trailers.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    url: Uri,
    redirected: bool,
    body: Body,
    decoders: DecoderSet,
}

impl Response {
    pub(crate) fn new(
        parts: http::response::Parts,
        body: Body,
        url: Uri,
        redirected: bool,
        decoders: DecoderSet,
    ) -> Self {
        Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            url,
            redirected,
            body,
            decoders,
        }
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The negotiated HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The URL the response was fetched from, after any redirects.
    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// Whether at least one redirect was followed to reach this response.
    pub fn redirected(&self) -> bool {
        self.redirected
    }

    /// Stream the raw body, without content decoding.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Buffer the whole body, decode it per `content-encoding`, and return
    /// it together with any trailers.
    pub async fn collect(self) -> Result<CollectedResponse> {
        let encoding = self
            .headers
            .get(http::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let collected = self.body.collect().await.map_err(Error::from_body)?;
        let trailers = collected.trailers().cloned();
        let bytes = self
            .decoders
            .decode(encoding.as_deref(), collected.to_bytes())?;
        Ok(CollectedResponse { bytes, trailers })
    }

    /// The decoded body bytes.
    pub async fn bytes(self) -> Result<Bytes> {
        Ok(self.collect().await?.bytes)
    }

    /// The decoded body as text (lossy UTF-8).
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// A fully buffered, decoded response body.
#[derive(Debug, Clone)]
pub struct CollectedResponse {
    /// The decoded body.
    pub bytes: Bytes,
    /// HTTP trailers, when the server sent any.
    pub trailers: Option<HeaderMap>,
}

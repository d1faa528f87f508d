//! fetchdriver
//!
//! A Fetch-style HTTP client speaking HTTP/1.1 and HTTP/2 over one API.
//!
//! A [`Client`] keeps an origin-keyed cache of connections: HTTP/1.1 origins
//! get a socket pool with keep-alive, HTTP/2 origins share one multiplexed
//! session, and `https://` origins pick between the two via ALPN at
//! handshake time. Sessions whose certificates cover additional names
//! (SANs, wildcards) are shared across those origins.
//!
//! ```no_run
//! # async fn run() -> fetchdriver::Result<()> {
//! let client = fetchdriver::Client::new();
//! let request = fetchdriver::Request::get("https://example.com/".parse().unwrap());
//! let response = client.fetch(request).await?;
//! let text = response.text().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Requests carry Fetch semantics: redirects are followed (with loop
//! detection, under one absolute deadline), `accept-encoding` is negotiated
//! and bodies decoded on collect, cookies round-trip through a jar, and an
//! [`AbortController`] cancels a fetch from the outside.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod abort;
mod body;
mod cache;
mod client;
mod config;
mod cookies;
mod decode;
mod engine;
mod error;
mod origin;
mod pool;
mod request;
mod response;
mod session;
mod tls;

pub use abort::{AbortController, AbortSignal};
pub use body::Body;
pub use client::Client;
pub use config::{
    Config, ConfigBuilder, CookieJarConfig, Http1Config, PerOrigin, DEFAULT_USER_AGENT,
};
pub use cookies::{CookieJar, MemoryCookieJar};
pub use decode::{BrotliDecoder, ContentDecoder, DeflateDecoder, GzipDecoder};
pub use error::{Error, Result};
pub use origin::{Origin, Scheme};
pub use request::{RedirectMode, Request};
pub use response::{CollectedResponse, Response};
pub use session::{PushHandler, ServerPush};
pub use tls::{default_tls_config, Alpn};

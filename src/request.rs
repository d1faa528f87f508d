//! Outgoing requests and their per-request options.

use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{Method, Uri};

use crate::abort::AbortSignal;
use crate::body::Body;

/// What to do when a response redirects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    /// Follow the redirect chain (GET and HEAD only).
    #[default]
    Follow,
    /// Return the 3xx response as-is.
    Manual,
    /// Treat any redirect as an error.
    Error,
}

/// A request plus the options that steer its execution.
#[derive(Debug)]
pub struct Request {
    inner: http::Request<Body>,
    redirect: RedirectMode,
    timeout: Option<Duration>,
    abort: Option<AbortSignal>,
    cookies: Vec<(String, String)>,
    expose_set_cookie: bool,
}

impl Request {
    /// A request with an empty body.
    pub fn new(method: Method, url: Uri) -> Self {
        let mut inner = http::Request::new(Body::empty());
        *inner.method_mut() = method;
        *inner.uri_mut() = url;
        Self::from(inner)
    }

    /// A GET request.
    pub fn get(url: Uri) -> Self {
        Self::new(Method::GET, url)
    }

    /// A HEAD request.
    pub fn head(url: Uri) -> Self {
        Self::new(Method::HEAD, url)
    }

    /// A POST request carrying `body`.
    pub fn post(url: Uri, body: impl Into<Body>) -> Self {
        Self::new(Method::POST, url).body(body)
    }

    /// Replace the request body.
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        *self.inner.body_mut() = body.into();
        self
    }

    /// Append a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.inner.headers_mut().append(name, value);
        self
    }

    /// Set the redirect policy.
    pub fn redirect(mut self, mode: RedirectMode) -> Self {
        self.redirect = mode;
        self
    }

    /// Fail the fetch after `timeout`, measured from the first attempt and
    /// spanning the whole redirect chain.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cancel the fetch when `signal` fires.
    pub fn abort(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    /// Send an extra cookie with this request only.
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Keep `set-cookie` headers visible on the response instead of
    /// stripping them after the jar has seen them.
    pub fn expose_set_cookie(mut self, expose: bool) -> Self {
        self.expose_set_cookie = expose;
        self
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    /// The target URL.
    pub fn url(&self) -> &Uri {
        self.inner.uri()
    }

    /// The request headers.
    pub fn headers(&self) -> &http::HeaderMap {
        self.inner.headers()
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
        self.inner.headers_mut()
    }

    pub(crate) fn redirect_mode(&self) -> RedirectMode {
        self.redirect
    }

    pub(crate) fn timeout_value(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn abort_signal(&self) -> Option<&AbortSignal> {
        self.abort.as_ref()
    }

    pub(crate) fn extra_cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub(crate) fn exposes_set_cookie(&self) -> bool {
        self.expose_set_cookie
    }

    pub(crate) fn inner(&self) -> &http::Request<Body> {
        &self.inner
    }

    pub(crate) fn take_body(&mut self) -> Body {
        std::mem::take(self.inner.body_mut())
    }

    pub(crate) fn restore_body(&mut self, body: Body) {
        *self.inner.body_mut() = body;
    }

    pub(crate) fn set_url(&mut self, url: Uri) {
        *self.inner.uri_mut() = url;
    }
}

impl From<http::Request<Body>> for Request {
    fn from(inner: http::Request<Body>) -> Self {
        Self {
            inner,
            redirect: RedirectMode::default(),
            timeout: None,
            abort: None,
            cookies: Vec::new(),
            expose_set_cookie: false,
        }
    }
}

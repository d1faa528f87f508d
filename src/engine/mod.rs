//! Per-request execution, shared between the HTTP/1.1 and HTTP/2 engines.
//!
//! The orchestrator resolves a transport and hands the request here. This
//! module owns what both engines share: final header assembly, the
//! deadline/abort race around the wire I/O, redirect interpretation, and
//! `set-cookie` processing.

pub(crate) mod http1;
pub(crate) mod http2;

use std::sync::Arc;
use std::time::Duration;

use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode, Uri};
use tokio::time::Instant;
use tracing::trace;

use crate::abort::AbortSignal;
use crate::cookies::CookieJar;
use crate::error::{Error, Result};
use crate::request::{RedirectMode, Request};

/// Everything an engine needs besides the transport itself.
pub(crate) struct RequestContext<'a> {
    pub(crate) user_agent: String,
    pub(crate) accept: String,
    pub(crate) accept_encoding: String,
    pub(crate) jar: Option<&'a Arc<dyn CookieJar>>,
    /// Absolute deadline, fixed on the first attempt and carried verbatim
    /// across redirects and retries.
    pub(crate) deadline: Option<Instant>,
    /// The configured total timeout, for error reporting.
    pub(crate) timeout: Option<Duration>,
}

/// Assemble the final outgoing headers on `request`.
///
/// Caller-supplied headers win; the client only fills what is absent, except
/// `accept-encoding` and `cookie`, which it owns.
pub(crate) fn prepare_headers(request: &mut Request, ctx: &RequestContext<'_>) -> Result<()> {
    // Connection upgrades are out of scope for this client.
    if request.headers().contains_key(header::UPGRADE) {
        return Err(Error::UpgradeNotSupported);
    }
    let url = request.url().clone();
    let body_length = request.inner().body().content_length();
    let method = request.method().clone();
    let headers = request.headers_mut();

    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_str(&ctx.user_agent)
                .map_err(|_| Error::fetch("user-agent is not a valid header value"))?,
        );
    }
    if !headers.contains_key(header::ACCEPT) {
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_str(&ctx.accept)
                .map_err(|_| Error::fetch("accept is not a valid header value"))?,
        );
    }
    headers.insert(
        header::ACCEPT_ENCODING,
        HeaderValue::from_str(&ctx.accept_encoding)
            .map_err(|_| Error::fetch("accept-encoding is not a valid header value"))?,
    );

    // Infer content-length for replayable bodies on methods that carry one.
    if let Some(length) = body_length {
        if length > 0
            && !headers.contains_key(header::CONTENT_LENGTH)
            && method != Method::GET
            && method != Method::HEAD
        {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        }
    }

    let cookie_header = assemble_cookies(ctx.jar, &url, request.extra_cookies());
    let headers = request.headers_mut();
    match cookie_header {
        Some(value) => {
            headers.insert(
                header::COOKIE,
                HeaderValue::from_str(&value)
                    .map_err(|_| Error::fetch("cookie is not a valid header value"))?,
            );
        }
        None => {
            headers.remove(header::COOKIE);
        }
    }
    Ok(())
}

/// Jar cookies plus request-supplied extras, joined `; `.
fn assemble_cookies(
    jar: Option<&Arc<dyn CookieJar>>,
    url: &Uri,
    extra: &[(String, String)],
) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(jar) = jar {
        if let Some(header) = jar.cookie_header_for(url) {
            parts.push(header);
        }
    }
    for (name, value) in extra {
        parts.push(format!("{name}={value}"));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

/// Run `io` against the request's deadline and abort signal; the first to
/// resolve wins. Losing futures are dropped, which tears down any stream
/// state they held.
pub(crate) async fn race<T>(
    io: impl std::future::Future<Output = Result<T>>,
    ctx: &RequestContext<'_>,
    abort: Option<&AbortSignal>,
) -> Result<T> {
    let deadline = async {
        match ctx.deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    let aborted = async {
        match abort {
            Some(signal) => signal.aborted().await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        result = io => result,
        () = deadline => Err(Error::Timeout(ctx.timeout.unwrap_or_default())),
        () = aborted => Err(Error::Abort),
    }
}

/// What a response's status tells the engine to do next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RedirectAction {
    /// Not a redirect (or `manual` mode): hand the response to the caller.
    Return,
    /// Follow to this absolute URL.
    Follow(Uri),
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Interpret a response status against the redirect policy.
pub(crate) fn redirect_action(
    status: StatusCode,
    headers: &HeaderMap,
    mode: RedirectMode,
    method: &Method,
    current: &Uri,
) -> Result<RedirectAction> {
    if !is_redirect(status) {
        return Ok(RedirectAction::Return);
    }
    match mode {
        RedirectMode::Manual => Ok(RedirectAction::Return),
        RedirectMode::Error => Err(Error::RedirectNotAllowed),
        RedirectMode::Follow => {
            let location = headers
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or(Error::MissingLocation)?;
            // Replaying a consumed body is unsupported.
            if *method != Method::GET && *method != Method::HEAD {
                return Err(Error::UnsupportedRedirect(method.clone()));
            }
            let next = resolve_location(current, location)?;
            trace!(%status, next = %next, "following redirect");
            Ok(RedirectAction::Follow(next))
        }
    }
}

/// Resolve a `Location` header against the URL it came from.
fn resolve_location(base: &Uri, location: &str) -> Result<Uri> {
    let uri: Uri = location
        .parse()
        .map_err(|_| Error::fetch(format!("invalid redirect location {location:?}")))?;
    if uri.scheme().is_some() {
        return Ok(uri);
    }

    if location.starts_with("//") {
        // Scheme-relative: borrow the base scheme and reparse whole.
        let scheme = base.scheme_str().unwrap_or("http");
        return format!("{scheme}:{location}")
            .parse()
            .map_err(|_| Error::fetch(format!("invalid redirect location {location:?}")));
    }

    let mut parts = base.clone().into_parts();
    if location.starts_with('/') {
        parts.path_and_query = uri.path_and_query().cloned();
    } else {
        // Relative path: merge with the base path's directory.
        let base_path = base.path();
        let directory = &base_path[..base_path.rfind('/').map(|i| i + 1).unwrap_or(0)];
        let merged = format!("{directory}{location}");
        parts.path_and_query = Some(
            merged
                .parse()
                .map_err(|_| Error::fetch(format!("invalid redirect location {location:?}")))?,
        );
    }
    Uri::from_parts(parts).map_err(|err| Error::fetch(format!("invalid redirect target: {err}")))
}

/// Feed `set-cookie` headers to the jar and strip them unless the request
/// opted in to reading them.
pub(crate) fn process_set_cookie(
    headers: &mut HeaderMap,
    jar: Option<&Arc<dyn CookieJar>>,
    url: &Uri,
    expose: bool,
) {
    let set_cookie2 = header::HeaderName::from_static("set-cookie2");
    if let Some(jar) = jar {
        let values: Vec<String> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .chain(headers.get_all(&set_cookie2).iter())
            .filter_map(|v| v.to_str().ok())
            .map(str::to_owned)
            .collect();
        if !values.is_empty() {
            jar.store(&values, url);
        }
    }
    if !expose {
        headers.remove(header::SET_COOKIE);
        headers.remove(set_cookie2);
    }
}

/// Convert an absolute request URL to origin-form for the wire.
pub(crate) fn origin_form(url: &Uri) -> Uri {
    url.path_and_query()
        .cloned()
        .map(Uri::from)
        .unwrap_or_else(|| Uri::from_static("/"))
}

/// Strip per-hop state from a request before re-sending it to the next hop.
pub(crate) fn rebase_for_redirect(request: &mut Request, next: Uri) {
    let headers = request.headers_mut();
    headers.remove(header::COOKIE);
    headers.remove(header::HOST);
    request.set_url(next);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn non_redirect_statuses_pass_through() {
        let headers = HeaderMap::new();
        for status in [StatusCode::OK, StatusCode::NOT_MODIFIED, StatusCode::NOT_FOUND] {
            assert_eq!(
                redirect_action(
                    status,
                    &headers,
                    RedirectMode::Follow,
                    &Method::GET,
                    &uri("http://a.test/")
                )
                .unwrap(),
                RedirectAction::Return
            );
        }
    }

    #[test]
    fn redirect_policy_is_enforced() {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/next"));
        let current = uri("http://a.test/start");

        assert_eq!(
            redirect_action(
                StatusCode::FOUND,
                &headers,
                RedirectMode::Manual,
                &Method::GET,
                &current
            )
            .unwrap(),
            RedirectAction::Return
        );
        assert!(matches!(
            redirect_action(
                StatusCode::FOUND,
                &headers,
                RedirectMode::Error,
                &Method::GET,
                &current
            ),
            Err(Error::RedirectNotAllowed)
        ));
        assert_eq!(
            redirect_action(
                StatusCode::FOUND,
                &headers,
                RedirectMode::Follow,
                &Method::GET,
                &current
            )
            .unwrap(),
            RedirectAction::Follow(uri("http://a.test/next"))
        );
    }

    #[test]
    fn only_get_and_head_may_follow() {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/next"));
        let result = redirect_action(
            StatusCode::MOVED_PERMANENTLY,
            &headers,
            RedirectMode::Follow,
            &Method::POST,
            &uri("http://a.test/submit"),
        );
        assert!(matches!(result, Err(Error::UnsupportedRedirect(m)) if m == Method::POST));
    }

    #[test]
    fn missing_location_is_an_error_when_following() {
        let headers = HeaderMap::new();
        assert!(matches!(
            redirect_action(
                StatusCode::FOUND,
                &headers,
                RedirectMode::Follow,
                &Method::GET,
                &uri("http://a.test/")
            ),
            Err(Error::MissingLocation)
        ));
    }

    #[test]
    fn locations_resolve_like_a_browser() {
        let base = uri("https://a.test/dir/page?q=1");
        assert_eq!(
            resolve_location(&base, "https://b.test/x").unwrap(),
            uri("https://b.test/x")
        );
        assert_eq!(
            resolve_location(&base, "//b.test/x").unwrap(),
            uri("https://b.test/x")
        );
        assert_eq!(
            resolve_location(&base, "/rooted").unwrap(),
            uri("https://a.test/rooted")
        );
        assert_eq!(
            resolve_location(&base, "sibling").unwrap(),
            uri("https://a.test/dir/sibling")
        );
    }

    #[test]
    fn origin_form_drops_scheme_and_authority() {
        assert_eq!(
            origin_form(&uri("http://a.test/path?q=2")),
            uri("/path?q=2")
        );
        assert_eq!(origin_form(&uri("http://a.test")), uri("/"));
    }

    #[test]
    fn upgrade_requests_are_rejected() {
        let mut request = Request::get(uri("http://a.test/ws"));
        request
            .headers_mut()
            .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        let ctx = RequestContext {
            user_agent: "test".into(),
            accept: "*/*".into(),
            accept_encoding: "identity".into(),
            jar: None,
            deadline: None,
            timeout: None,
        };
        assert!(matches!(
            prepare_headers(&mut request, &ctx),
            Err(Error::UpgradeNotSupported)
        ));
    }

    #[test]
    fn set_cookie_is_stripped_unless_exposed() {
        use crate::cookies::MemoryCookieJar;

        let jar: Arc<dyn CookieJar> = Arc::new(MemoryCookieJar::new());
        let url = uri("http://a.test/");
        let mut headers = HeaderMap::new();
        headers.insert(header::SET_COOKIE, HeaderValue::from_static("sid=1"));

        process_set_cookie(&mut headers, Some(&jar), &url, false);
        assert!(headers.get(header::SET_COOKIE).is_none());
        assert_eq!(jar.cookie_header_for(&url), Some("sid=1".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(header::SET_COOKIE, HeaderValue::from_static("sid=2"));
        process_set_cookie(&mut headers, Some(&jar), &url, true);
        assert!(headers.get(header::SET_COOKIE).is_some());
    }
}

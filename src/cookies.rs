//! Cookie propagation between requests.
//!
//! The client only needs two things from a jar: a `cookie` header for an
//! outgoing request, and a place to store incoming `set-cookie` values.
//! [`MemoryCookieJar`] covers the common case with RFC 6265 domain and path
//! matching; anything fancier (expiry, persistence, public-suffix rules)
//! belongs to a caller-supplied implementation.

use std::collections::HashMap;
use std::fmt;

use http::Uri;
use parking_lot::Mutex;

/// Stores cookies between requests and produces `cookie` headers.
///
/// Implementations are shared across clones of the client and must be
/// internally synchronized.
pub trait CookieJar: Send + Sync {
    /// The `cookie` header value for a request to `uri`, if any cookies match.
    fn cookie_header_for(&self, uri: &Uri) -> Option<String>;

    /// Record `set-cookie` values received from a response to `uri`.
    fn store(&self, set_cookie_values: &[String], uri: &Uri);

    /// Drop every stored cookie.
    fn reset(&self);
}

impl fmt::Debug for dyn CookieJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CookieJar")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    host_only: bool,
    path: String,
    secure: bool,
}

impl StoredCookie {
    /// Parse a single `set-cookie` value in the context of the request `uri`.
    ///
    /// Unknown attributes are ignored; a missing `Domain` pins the cookie to
    /// the exact request host, and a missing `Path` defaults to the request
    /// path's directory per RFC 6265 §5.1.4.
    fn parse(header: &str, uri: &Uri) -> Option<Self> {
        let request_host = uri.host()?.to_ascii_lowercase();
        let mut parts = header.split(';').map(str::trim);

        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = StoredCookie {
            name: name.to_string(),
            value: value.trim().to_string(),
            domain: request_host,
            host_only: true,
            path: default_path(uri.path()),
            secure: false,
        };

        for attr in parts {
            if attr.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            } else if let Some((key, val)) = attr.split_once('=') {
                match key.trim().to_ascii_lowercase().as_str() {
                    "domain" => {
                        let domain = val
                            .trim()
                            .strip_prefix('.')
                            .unwrap_or(val.trim())
                            .to_ascii_lowercase();
                        if !domain.is_empty() {
                            // Reject domains the request host isn't under.
                            if !domain_matches(&cookie.domain, &domain) {
                                return None;
                            }
                            cookie.domain = domain;
                            cookie.host_only = false;
                        }
                    }
                    "path" => {
                        let path = val.trim();
                        if path.starts_with('/') {
                            cookie.path = path.to_string();
                        }
                    }
                    _ => {}
                }
            }
        }
        Some(cookie)
    }

    fn matches(&self, uri: &Uri) -> bool {
        let Some(host) = uri.host() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        if self.host_only {
            if host != self.domain {
                return false;
            }
        } else if !domain_matches(&host, &self.domain) {
            return false;
        }
        if self.secure && uri.scheme_str() != Some("https") {
            return false;
        }
        path_matches(uri.path(), &self.path)
    }
}

/// RFC 6265 §5.1.3 domain matching: exact, or a dot-boundary suffix.
fn domain_matches(request_host: &str, cookie_domain: &str) -> bool {
    request_host == cookie_domain
        || (request_host.len() > cookie_domain.len()
            && request_host.ends_with(cookie_domain)
            && request_host.as_bytes()[request_host.len() - cookie_domain.len() - 1] == b'.')
}

/// RFC 6265 §5.1.4 path matching.
fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    let request_path = if request_path.is_empty() { "/" } else { request_path };
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path.as_bytes()[cookie_path.len()] == b'/'))
}

/// Default cookie path: the request path up to its last `/`.
fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(idx) if idx > 0 => request_path[..idx].to_string(),
        _ => "/".to_string(),
    }
}

/// In-memory [`CookieJar`] with domain and path matching.
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    // Keyed by (domain, path, name) so re-setting a cookie replaces it.
    cookies: Mutex<HashMap<(String, String, String), StoredCookie>>,
}

impl MemoryCookieJar {
    /// An empty jar.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CookieJar for MemoryCookieJar {
    fn cookie_header_for(&self, uri: &Uri) -> Option<String> {
        let cookies = self.cookies.lock();
        let mut matched: Vec<&StoredCookie> =
            cookies.values().filter(|c| c.matches(uri)).collect();
        if matched.is_empty() {
            return None;
        }
        // Longer paths first, per RFC 6265 §5.4.
        matched.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Some(
            matched
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn store(&self, set_cookie_values: &[String], uri: &Uri) {
        let mut cookies = self.cookies.lock();
        for value in set_cookie_values {
            if let Some(cookie) = StoredCookie::parse(value, uri) {
                let key = (
                    cookie.domain.clone(),
                    cookie.path.clone(),
                    cookie.name.clone(),
                );
                cookies.insert(key, cookie);
            }
        }
    }

    fn reset(&self) {
        self.cookies.lock().clear();
    }
}

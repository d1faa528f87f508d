//! Origins and protocol tags, the keys of the connection cache.

use std::fmt;

use http::Uri;

use crate::error::Error;

/// A `scheme://host:port` triple identifying a connection caching key.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Origin {
    scheme: Scheme,
    host: String,
    port: u16,
}

/// URL scheme recognized by the client.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Scheme {
    /// Cleartext `http://`
    Http,
    /// TLS `https://`
    Https,
}

impl Scheme {
    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl Origin {
    /// Build an origin from explicit parts. The host is lowercased.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Extract the origin of a URI.
    ///
    /// Fails with [`Error::Fetch`] when the scheme is missing or not
    /// `http`/`https`, or when the host is missing.
    pub fn from_uri(uri: &Uri) -> Result<Self, Error> {
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            Some(other) => {
                return Err(Error::fetch(format!("unsupported url scheme: {other}")));
            }
            None => return Err(Error::fetch(format!("missing scheme in url: {uri}"))),
        };

        let host = uri
            .host()
            .ok_or_else(|| Error::fetch(format!("missing host in url: {uri}")))?;
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());

        Ok(Self::new(scheme, host, port))
    }

    /// The origin's scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The origin's host, lowercased.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The origin's port, with scheme defaults applied.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, the form used for socket connects and TLS SNI.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// An origin with the same authority but for the given host name.
    ///
    /// Used to resolve wildcard certificate matches back into cache keys.
    pub(crate) fn with_host(&self, host: &str) -> Self {
        Self::new(self.scheme, host, self.port)
    }

    /// True when this origin uses TLS.
    pub fn is_secure(&self) -> bool {
        matches!(self.scheme, Scheme::Https)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Protocol class of a cached session or pool.
///
/// `Http1`/`Http2` are cleartext; `Https1`/`Https2` are the two possible
/// outcomes of ALPN negotiation over TLS.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum ProtocolTag {
    /// Cleartext HTTP/1.1
    Http1,
    /// Cleartext HTTP/2 (prior knowledge)
    Http2,
    /// HTTP/1.1 over TLS
    Https1,
    /// HTTP/2 over TLS
    Https2,
}

impl ProtocolTag {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ProtocolTag::Http1 => "http1",
            ProtocolTag::Http2 => "http2",
            ProtocolTag::Https1 => "https1",
            ProtocolTag::Https2 => "https2",
        }
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `"<protocol-tag>:<origin>"` key of the origin cache.
pub(crate) fn cache_key(tag: ProtocolTag, origin: &Origin) -> String {
    format!("{}:{}", tag.as_str(), origin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_from_uri_applies_default_ports() {
        let origin = Origin::from_uri(&"http://example.com/a/b".parse().unwrap()).unwrap();
        assert_eq!(origin.to_string(), "http://example.com:80");

        let origin = Origin::from_uri(&"https://Example.COM/".parse().unwrap()).unwrap();
        assert_eq!(origin.to_string(), "https://example.com:443");

        let origin = Origin::from_uri(&"https://example.com:8443/x".parse().unwrap()).unwrap();
        assert_eq!(origin.port(), 8443);
    }

    #[test]
    fn origin_rejects_unknown_schemes() {
        let err = Origin::from_uri(&"ftp://example.com/".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));

        let err = Origin::from_uri(&"/relative/path".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
    }

    #[test]
    fn cache_key_format() {
        let origin = Origin::new(Scheme::Https, "example.com", 443);
        assert_eq!(
            cache_key(ProtocolTag::Https2, &origin),
            "https2:https://example.com:443"
        );
    }
}

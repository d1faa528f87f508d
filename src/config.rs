//! Client configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;

use crate::cookies::{CookieJar, MemoryCookieJar};
use crate::decode::ContentDecoder;
use crate::origin::Origin;
use crate::tls::Alpn;

/// The `user-agent` sent when none is configured.
pub const DEFAULT_USER_AGENT: &str =
    concat!("fetchdriver/", env!("CARGO_PKG_VERSION"));

/// A configuration value that is either constant or derived per origin.
#[derive(Clone)]
pub enum PerOrigin<T> {
    /// The same value for every origin.
    Constant(T),
    /// Computed from the origin being fetched.
    Dynamic(Arc<dyn Fn(&Origin) -> T + Send + Sync>),
}

impl<T: Clone> PerOrigin<T> {
    pub(crate) fn resolve(&self, origin: &Origin) -> T {
        match self {
            PerOrigin::Constant(value) => value.clone(),
            PerOrigin::Dynamic(f) => f(origin),
        }
    }
}

impl<T> From<T> for PerOrigin<T> {
    fn from(value: T) -> Self {
        PerOrigin::Constant(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for PerOrigin<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerOrigin::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            PerOrigin::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

/// HTTP/1.1 socket pool settings, per origin.
#[derive(Debug, Clone)]
pub struct Http1Config {
    /// Keep sockets open between requests. When off, released sockets are
    /// closed immediately instead of parked.
    pub keep_alive: bool,
    /// How long an idle socket may sit parked before it is closed.
    pub keep_alive_timeout: Option<Duration>,
    /// Upper bound on concurrent sockets to one origin.
    pub max_sockets: usize,
    /// Upper bound on parked idle sockets to one origin.
    pub max_free_sockets: usize,
    /// Time allowed for establishing a socket (TCP dial plus TLS handshake).
    pub socket_timeout: Option<Duration>,
}

impl Default for Http1Config {
    fn default() -> Self {
        Self {
            keep_alive: true,
            keep_alive_timeout: Some(Duration::from_secs(1)),
            max_sockets: usize::MAX,
            max_free_sockets: 256,
            socket_timeout: None,
        }
    }
}

impl Http1Config {
    /// The idle capacity the pool actually uses: keep-alive off means no
    /// socket is ever parked.
    pub(crate) fn effective_max_free_sockets(&self) -> usize {
        if self.keep_alive {
            self.max_free_sockets
        } else {
            0
        }
    }
}

/// How cookies are handled across requests.
#[derive(Clone, Default)]
pub enum CookieJarConfig {
    /// An internally managed [`MemoryCookieJar`].
    #[default]
    Internal,
    /// A caller-supplied jar.
    Custom(Arc<dyn CookieJar>),
    /// No cookie handling at all.
    Disabled,
}

impl fmt::Debug for CookieJarConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CookieJarConfig::Internal => f.write_str("Internal"),
            CookieJarConfig::Custom(_) => f.write_str("Custom"),
            CookieJarConfig::Disabled => f.write_str("Disabled"),
        }
    }
}

impl CookieJarConfig {
    pub(crate) fn build(&self) -> Option<Arc<dyn CookieJar>> {
        match self {
            CookieJarConfig::Internal => Some(Arc::new(MemoryCookieJar::new())),
            CookieJarConfig::Custom(jar) => Some(Arc::clone(jar)),
            CookieJarConfig::Disabled => None,
        }
    }
}

/// Client defaults, applied to every fetch unless overridden per request.
#[derive(Debug, Clone)]
pub struct Config {
    /// `user-agent` value, combined with [`DEFAULT_USER_AGENT`] according to
    /// `overwrite_user_agent`.
    pub user_agent: Option<PerOrigin<String>>,
    /// Replace the default user-agent entirely instead of appending it.
    pub overwrite_user_agent: bool,
    /// `accept` header value.
    pub accept: PerOrigin<String>,
    /// Cookie jar selection.
    pub cookie_jar: CookieJarConfig,
    /// Custom content decoders, consulted before the built-ins and
    /// advertised first in `accept-encoding`.
    pub decoders: Vec<Arc<dyn ContentDecoder>>,
    /// TLS client configuration; platform roots when unset.
    pub tls: Option<Arc<ClientConfig>>,
    /// Skip server certificate verification. Test servers only.
    pub danger_accept_invalid_certs: bool,
    /// Transport for bare `http://` origins.
    pub http_protocol: PerOrigin<Alpn>,
    /// Ordered ALPN preference for `https://` origins; empty means
    /// `h2` then `http/1.1`.
    pub https_protocols: PerOrigin<Vec<Alpn>>,
    /// HTTP/1.1 pool settings.
    pub http1: PerOrigin<Http1Config>,
    /// Attempt cap for a single logical fetch, counting internal retries
    /// (connection races, GOAWAY replays).
    pub max_retries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_agent: None,
            overwrite_user_agent: false,
            accept: PerOrigin::Constant("*/*".to_string()),
            cookie_jar: CookieJarConfig::Internal,
            decoders: Vec::new(),
            tls: None,
            danger_accept_invalid_certs: false,
            http_protocol: PerOrigin::Constant(Alpn::Http1),
            https_protocols: PerOrigin::Constant(Vec::new()),
            http1: PerOrigin::Constant(Http1Config::default()),
            max_retries: 10,
        }
    }
}

impl Config {
    /// Start building a configuration from the defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// The `user-agent` to send to `origin`.
    pub(crate) fn resolve_user_agent(&self, origin: &Origin) -> String {
        match &self.user_agent {
            None => DEFAULT_USER_AGENT.to_string(),
            Some(ua) => {
                let ua = ua.resolve(origin);
                if self.overwrite_user_agent {
                    ua
                } else {
                    format!("{ua} {DEFAULT_USER_AGENT}")
                }
            }
        }
    }
}

/// Builder for [`Config`].
#[derive(Debug)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the `user-agent`.
    pub fn user_agent(mut self, value: impl Into<PerOrigin<String>>) -> Self {
        self.config.user_agent = Some(value.into());
        self
    }

    /// Use the configured `user-agent` verbatim instead of appending the
    /// default one.
    pub fn overwrite_user_agent(mut self, overwrite: bool) -> Self {
        self.config.overwrite_user_agent = overwrite;
        self
    }

    /// Set the `accept` header.
    pub fn accept(mut self, value: impl Into<PerOrigin<String>>) -> Self {
        self.config.accept = value.into();
        self
    }

    /// Use a caller-managed cookie jar.
    pub fn cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.config.cookie_jar = CookieJarConfig::Custom(jar);
        self
    }

    /// Disable cookie handling entirely.
    pub fn no_cookies(mut self) -> Self {
        self.config.cookie_jar = CookieJarConfig::Disabled;
        self
    }

    /// Register a custom content decoder. Decoders are consulted in
    /// registration order, before the built-ins.
    pub fn decoder(mut self, decoder: Arc<dyn ContentDecoder>) -> Self {
        self.config.decoders.push(decoder);
        self
    }

    /// Use a specific TLS client configuration.
    pub fn tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.config.tls = Some(config);
        self
    }

    /// Accept any server certificate. Test servers only.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.danger_accept_invalid_certs = accept;
        self
    }

    /// Transport used for bare `http://` origins.
    pub fn http_protocol(mut self, protocol: impl Into<PerOrigin<Alpn>>) -> Self {
        self.config.http_protocol = protocol.into();
        self
    }

    /// Ordered ALPN preference for `https://` origins.
    pub fn https_protocols(mut self, protocols: impl Into<PerOrigin<Vec<Alpn>>>) -> Self {
        self.config.https_protocols = protocols.into();
        self
    }

    /// HTTP/1.1 pool settings.
    pub fn http1(mut self, http1: impl Into<PerOrigin<Http1Config>>) -> Self {
        self.config.http1 = http1.into();
        self
    }

    /// Cap on attempts for one logical fetch.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.config.max_retries = max_retries.max(1);
        self
    }

    /// Finish the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::Scheme;

    fn origin() -> Origin {
        Origin::new(Scheme::Https, "config.test", 443)
    }

    #[test]
    fn user_agent_appends_unless_overwritten() {
        let config = Config::default();
        assert_eq!(config.resolve_user_agent(&origin()), DEFAULT_USER_AGENT);

        let config = Config::builder().user_agent("myapp/2.0".to_string()).build();
        assert_eq!(
            config.resolve_user_agent(&origin()),
            format!("myapp/2.0 {DEFAULT_USER_AGENT}")
        );

        let config = Config::builder()
            .user_agent("myapp/2.0".to_string())
            .overwrite_user_agent(true)
            .build();
        assert_eq!(config.resolve_user_agent(&origin()), "myapp/2.0");
    }

    #[test]
    fn per_origin_values_resolve_dynamically() {
        let accept = PerOrigin::Dynamic(Arc::new(|origin: &Origin| {
            if origin.host() == "api.test" {
                "application/json".to_string()
            } else {
                "*/*".to_string()
            }
        }));
        assert_eq!(
            accept.resolve(&Origin::new(Scheme::Https, "api.test", 443)),
            "application/json"
        );
        assert_eq!(accept.resolve(&origin()), "*/*");
    }

    #[test]
    fn keep_alive_off_disables_parking() {
        let http1 = Http1Config {
            keep_alive: false,
            ..Http1Config::default()
        };
        assert_eq!(http1.effective_max_free_sockets(), 0);
        assert_eq!(
            Http1Config::default().effective_max_free_sockets(),
            256
        );
    }
}

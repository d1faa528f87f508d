//! TLS connection setup and ALPN protocol discovery.
//!
//! The negotiator dials the origin, offers the configured protocols via
//! ALPN, and reports what the server picked along with the certificate's
//! subject alternative names, which the cache uses to share the connection
//! across hostnames.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::{Error, Result};

/// An application protocol negotiable via ALPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alpn {
    /// `http/1.1`
    Http1,
    /// `h2`
    Http2,
}

impl Alpn {
    fn as_bytes(&self) -> &'static [u8] {
        match self {
            Alpn::Http1 => b"http/1.1",
            Alpn::Http2 => b"h2",
        }
    }

    fn from_wire(token: &[u8]) -> Option<Self> {
        match token {
            b"http/1.1" => Some(Alpn::Http1),
            b"h2" => Some(Alpn::Http2),
            _ => None,
        }
    }
}

/// TLS client configuration with platform roots and no ALPN preset.
///
/// The negotiator fills in `alpn_protocols` per connection.
pub fn default_tls_config() -> ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        warn!(%error, "could not load a platform certificate");
    }
    for cert in native.certs {
        if let Err(error) = roots.add(cert) {
            warn!(%error, "could not add a platform certificate");
        }
    }
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// A `default_tls_config` that accepts any server certificate.
pub(crate) fn insecure_tls_config() -> ClientConfig {
    let mut config = default_tls_config();
    let provider = config.crypto_provider().clone();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(danger::DisabledVerifier(provider)));
    config
}

mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    #[derive(Debug)]
    pub(super) struct DisabledVerifier(pub(super) Arc<CryptoProvider>);

    impl ServerCertVerifier for DisabledVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

/// Deduplicate the preference list, defaulting to `h2` then `http/1.1`.
pub(crate) fn normalize_protocols(preferred: &[Alpn]) -> Vec<Alpn> {
    let mut protocols = Vec::new();
    for protocol in preferred {
        if !protocols.contains(protocol) {
            protocols.push(*protocol);
        }
    }
    if protocols.is_empty() {
        protocols = vec![Alpn::Http2, Alpn::Http1];
    }
    protocols
}

/// The protocol to assume when the server answered without ALPN: a single
/// offer is taken at face value, an ambiguous offer degrades to HTTP/1.1.
pub(crate) fn fallback_protocol(offered: &[Alpn]) -> Alpn {
    match offered {
        [single] => *single,
        _ => Alpn::Http1,
    }
}

/// Outcome of a TLS connection attempt.
pub(crate) struct Negotiated {
    pub(crate) io: TlsStream<TcpStream>,
    pub(crate) alpn: Alpn,
    /// DNS names from the certificate's SAN extension, or the CN when no
    /// SANs are present. May contain wildcard patterns.
    pub(crate) alt_names: Vec<String>,
}

impl std::fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiated")
            .field("alpn", &self.alpn)
            .field("alt_names", &self.alt_names)
            .finish()
    }
}

/// Dials origins over TLS with ALPN.
#[derive(Clone)]
pub(crate) struct TlsNegotiator {
    base: Arc<ClientConfig>,
    connect_timeout: Option<Duration>,
}

impl std::fmt::Debug for TlsNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsNegotiator")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl TlsNegotiator {
    pub(crate) fn new(base: Arc<ClientConfig>, connect_timeout: Option<Duration>) -> Self {
        Self {
            base,
            connect_timeout,
        }
    }

    /// Connect to `host:port`, offering `protocols` in order.
    ///
    /// The timeout covers the TCP dial and the handshake together; hitting
    /// it tears down the socket and surfaces [`Error::Timeout`].
    pub(crate) async fn connect(
        &self,
        host: &str,
        port: u16,
        protocols: &[Alpn],
    ) -> Result<Negotiated> {
        let offered = normalize_protocols(protocols);
        match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.handshake(host, port, &offered))
                .await
                .map_err(|_| Error::Timeout(timeout))?,
            None => self.handshake(host, port, &offered).await,
        }
    }

    async fn handshake(&self, host: &str, port: u16, offered: &[Alpn]) -> Result<Negotiated> {
        let mut config = (*self.base).clone();
        config.alpn_protocols = offered.iter().map(|p| p.as_bytes().to_vec()).collect();

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::Tls(format!("invalid server name {host:?}")))?;

        trace!(host, port, "dialing");
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;

        let connector = TlsConnector::from(Arc::new(config));
        let io = connector
            .connect(server_name, tcp)
            .await
            .map_err(|err| Error::Tls(err.to_string()))?;

        let (_, connection) = io.get_ref();
        let alpn = connection
            .alpn_protocol()
            .and_then(Alpn::from_wire)
            .unwrap_or_else(|| fallback_protocol(offered));
        let alt_names = connection
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| alt_names_from_der(cert.as_ref()))
            .unwrap_or_default();
        debug!(host, port, ?alpn, "tls negotiated");

        Ok(Negotiated {
            io,
            alpn,
            alt_names,
        })
    }
}

/// DNS names the certificate is valid for: every SAN DNS entry, or the
/// subject CN when the certificate carries no SAN extension.
fn alt_names_from_der(der: &[u8]) -> Vec<String> {
    let Ok((_, cert)) = X509Certificate::from_der(der) else {
        warn!("could not parse the peer certificate");
        return Vec::new();
    };
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        let names: Vec<String> = san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect();
        if !names.is_empty() {
            return names;
        }
    }
    let fallback = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|cn| vec![cn.to_string()])
        .unwrap_or_default();
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferences_deduplicate_in_order() {
        assert_eq!(
            normalize_protocols(&[Alpn::Http1, Alpn::Http2, Alpn::Http1]),
            vec![Alpn::Http1, Alpn::Http2]
        );
    }

    #[test]
    fn empty_preference_offers_h2_first() {
        assert_eq!(normalize_protocols(&[]), vec![Alpn::Http2, Alpn::Http1]);
    }

    #[test]
    fn no_alpn_answer_maps_by_offer() {
        assert_eq!(fallback_protocol(&[Alpn::Http2]), Alpn::Http2);
        assert_eq!(fallback_protocol(&[Alpn::Http1]), Alpn::Http1);
        assert_eq!(fallback_protocol(&[Alpn::Http2, Alpn::Http1]), Alpn::Http1);
    }

    #[test]
    fn wire_tokens_round_trip() {
        assert_eq!(Alpn::from_wire(b"h2"), Some(Alpn::Http2));
        assert_eq!(Alpn::from_wire(b"http/1.1"), Some(Alpn::Http1));
        assert_eq!(Alpn::from_wire(b"spdy/3"), None);
        assert_eq!(Alpn::Http2.as_bytes(), b"h2");
    }
}

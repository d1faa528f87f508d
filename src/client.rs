//! The fetch client: origin-keyed connection caching and orchestration.
//!
//! [`Client`] owns the connection cache, the HTTP/1.1 pools, and the HTTP/2
//! session manager. A fetch resolves its origin to a cached transport (or
//! establishes one behind a per-key funnel so concurrent fetches to a cold
//! origin dial once), dispatches the request on the matching engine, and
//! loops over redirects and internal retries with one absolute deadline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::body::Body;
use crate::cache::OriginCache;
use crate::config::{Config, Http1Config};
use crate::cookies::CookieJar;
use crate::decode::DecoderSet;
use crate::engine::http1::H1Socket;
use crate::engine::{self, http1, http2, RedirectAction, RequestContext};
use crate::error::{Error, Result};
use crate::origin::{Origin, ProtocolTag, Scheme};
use crate::pool::{Acquired, Http1Pool, Pooled};
use crate::request::Request;
use crate::response::Response;
use crate::session::{H2Session, Http2SessionManager, PushHandler};
use crate::tls::{default_tls_config, insecure_tls_config, Alpn, TlsNegotiator};

/// A cached transport for one origin entry.
#[derive(Clone)]
enum Handle {
    Pool(Http1Pool<H1Socket>),
    Session(Arc<H2Session>),
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Handle::Pool(a), Handle::Pool(b)) => a == b,
            (Handle::Session(a), Handle::Session(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handle::Pool(pool) => f.debug_tuple("Pool").field(pool).finish(),
            Handle::Session(session) => f.debug_tuple("Session").field(&session.origin()).finish(),
        }
    }
}

/// Transport resolved for one attempt. The HTTP/1 variant may carry a socket
/// already checked out by the establishment path.
enum Transport {
    H1 {
        pool: Http1Pool<H1Socket>,
        pre: Option<Pooled<H1Socket>>,
    },
    H2(Arc<H2Session>),
}

/// Configuration snapshot taken once per logical fetch, so a concurrent
/// [`Client::setup`] never changes a fetch midway.
struct Snapshot {
    config: Config,
    jar: Option<Arc<dyn CookieJar>>,
    decoders: DecoderSet,
    tls: Arc<rustls::ClientConfig>,
}

impl Snapshot {
    fn build(config: Config, reuse_jar: Option<Arc<dyn CookieJar>>) -> Self {
        let jar = match (&config.cookie_jar, reuse_jar) {
            // A reconfigure keeps the internal jar's contents.
            (crate::config::CookieJarConfig::Internal, Some(jar)) => Some(jar),
            (selection, _) => selection.build(),
        };
        let tls = match (&config.tls, config.danger_accept_invalid_certs) {
            (Some(tls), _) => Arc::clone(tls),
            (None, true) => Arc::new(insecure_tls_config()),
            (None, false) => Arc::new(default_tls_config()),
        };
        let decoders = DecoderSet::new(config.decoders.clone());
        Self {
            config,
            jar,
            decoders,
            tls,
        }
    }
}

/// State carried across the hops and retries of one logical fetch.
struct FetchAttemptState {
    /// URLs already fetched in this redirect chain, oldest first.
    redirected: Vec<Uri>,
    /// Absolute deadline, fixed before the first attempt.
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    /// Origins already granted a GOAWAY replay; one per origin per fetch.
    goaway_retried: HashSet<Origin>,
}

struct ClientInner {
    state: RwLock<Arc<Snapshot>>,
    cache: OriginCache<Handle>,
    sessions: Http2SessionManager,
    funnels: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// An HTTP client with Fetch-style semantics over HTTP/1.1 and HTTP/2.
///
/// Cheap to clone; clones share the connection cache.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("cached_origins", &self.inner.cache.len())
            .finish()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// A client with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// A client with `config` as its defaults.
    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                state: RwLock::new(Arc::new(Snapshot::build(config, None))),
                cache: OriginCache::new(),
                sessions: Http2SessionManager::new(),
                funnels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Replace the client defaults without discarding cached connections.
    ///
    /// Fetches already in flight keep the snapshot they started with.
    pub fn setup(&self, config: Config) {
        let mut state = self.inner.state.write();
        let reuse = state.jar.clone();
        *state = Arc::new(Snapshot::build(config, reuse));
    }

    /// Register (or clear) the handler invoked for HTTP/2 server pushes.
    ///
    /// With no handler registered, pushed streams are reset as they arrive.
    pub fn on_push(&self, handler: Option<PushHandler>) {
        self.inner.sessions.set_push_handler(handler);
    }

    /// Tear down every cached connection to `origin`, under all protocols.
    ///
    /// Checked-out sockets are force-closed and queued waiters fail with
    /// [`Error::Disconnected`]; in-flight response bodies error out.
    pub fn disconnect(&self, origin: &Origin) {
        self.inner.cache.disconnect(origin);
    }

    /// Tear down every cached connection.
    pub fn disconnect_all(&self) {
        self.inner.cache.disconnect_all();
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.inner.state.read())
    }

    /// Execute `request`, following redirects and replaying attempts lost to
    /// connection races, until a response, an error, or the attempt cap.
    pub async fn fetch(&self, request: impl Into<Request>) -> Result<Response> {
        let mut request = request.into();
        if let Some(signal) = request.abort_signal() {
            if signal.is_aborted() {
                return Err(Error::Abort);
            }
        }

        let state = self.snapshot();
        let timeout = request.timeout_value();
        let mut fetch = FetchAttemptState {
            redirected: Vec::new(),
            deadline: timeout.map(|t| Instant::now() + t),
            timeout,
            goaway_retried: HashSet::new(),
        };

        let mut retries = 0usize;
        loop {
            match self.attempt(&mut request, &state, &mut fetch).await {
                Ok(Attempt::Done(response)) => return Ok(response),
                Ok(Attempt::Redirect(next)) => {
                    if next == *request.url() || fetch.redirected.contains(&next) {
                        fetch.redirected.push(request.url().clone());
                        fetch.redirected.push(next);
                        let chain = fetch
                            .redirected
                            .iter()
                            .map(Uri::to_string)
                            .collect::<Vec<_>>()
                            .join(" -> ");
                        return Err(Error::RedirectLoop { chain });
                    }
                    fetch.redirected.push(request.url().clone());
                    engine::rebase_for_redirect(&mut request, next);
                }
                Err(err) if err.is_retry() => {
                    retries += 1;
                    if retries >= state.config.max_retries {
                        return Err(err);
                    }
                    trace!(retries, "retrying after a connection race");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One hop: resolve a transport for the current URL and execute on it.
    async fn attempt(
        &self,
        request: &mut Request,
        state: &Snapshot,
        fetch: &mut FetchAttemptState,
    ) -> Result<Attempt> {
        let origin = Origin::from_uri(request.url())?;
        let http1_config = state.config.http1.resolve(&origin);
        let ctx = RequestContext {
            user_agent: state.config.resolve_user_agent(&origin),
            accept: state.config.accept.resolve(&origin),
            accept_encoding: state.decoders.accept_encoding(),
            jar: state.jar.as_ref(),
            deadline: fetch.deadline,
            timeout: fetch.timeout,
        };
        engine::prepare_headers(request, &ctx)?;
        let abort = request.abort_signal().cloned();

        // Establishment counts against the same deadline as the exchange.
        let transport = engine::race(
            self.resolve_transport(&origin, state, &http1_config),
            &ctx,
            abort.as_ref(),
        )
        .await?;

        let body = request.take_body();
        let replay = body.try_clone();
        let mut wire = http::Request::new(body);
        *wire.method_mut() = request.method().clone();
        *wire.uri_mut() = request.url().clone();
        *wire.headers_mut() = request.headers().clone();

        let outcome = match transport {
            Transport::H1 { pool, pre } => {
                let io = self.execute_h1(&origin, &http1_config, pool, pre, wire);
                engine::race(io, &ctx, abort.as_ref()).await
            }
            Transport::H2(session) => {
                let session_ref = self.inner.sessions.acquire(&session);
                let io = http2::execute(&session_ref, &self.inner.sessions, &state.decoders, wire);
                let result = engine::race(io, &ctx, abort.as_ref()).await;
                if let Err(err) = &result {
                    if http2::is_goaway_race(err, session.is_goaway()) {
                        self.inner.cache.remove(&Handle::Session(Arc::clone(&session)));
                        self.inner.sessions.quarantine(Arc::clone(&session));
                        let replayable = replay.is_some();
                        if replayable && fetch.goaway_retried.insert(origin.clone()) {
                            debug!(origin = %origin, "stream lost to goaway, replaying");
                            if let Some(body) = replay {
                                request.restore_body(body);
                            }
                            return Err(Error::Retry);
                        }
                    }
                }
                result
            }
        };
        if let Some(body) = replay {
            request.restore_body(body);
        }
        let response = outcome?;

        let (mut parts, body) = response.into_parts();
        engine::process_set_cookie(
            &mut parts.headers,
            state.jar.as_ref(),
            request.url(),
            request.exposes_set_cookie(),
        );
        match engine::redirect_action(
            parts.status,
            &parts.headers,
            request.redirect_mode(),
            request.method(),
            request.url(),
        )? {
            RedirectAction::Follow(next) => Ok(Attempt::Redirect(next)),
            RedirectAction::Return => Ok(Attempt::Done(Response::new(
                parts,
                body,
                request.url().clone(),
                !fetch.redirected.is_empty(),
                state.decoders.clone(),
            ))),
        }
    }

    /// Check out a socket (connecting if the pool grants capacity), send the
    /// request, and tie the socket to the response body.
    async fn execute_h1(
        &self,
        origin: &Origin,
        http1_config: &Http1Config,
        pool: Http1Pool<H1Socket>,
        pre: Option<Pooled<H1Socket>>,
        wire: http::Request<Body>,
    ) -> Result<http::Response<Body>> {
        let mut socket = match pre {
            Some(socket) => socket,
            None => match pool.acquire().await? {
                Acquired::Reused(socket) => socket,
                Acquired::Connect(permit) => {
                    let tcp = self.dial(origin, http1_config.socket_timeout).await?;
                    let conn = http1::handshake(tcp).await?;
                    permit.register(conn)
                }
            },
        };
        let response = http1::execute(&mut socket, origin, wire).await?;
        let (parts, incoming) = response.into_parts();
        // The socket rides inside the body so it is not released (or closed
        // by pool maintenance) until the body is consumed or dropped.
        let body = Body::incoming_guarded(incoming, Box::new(socket));
        Ok(http::Response::from_parts(parts, body))
    }

    /// A live cached handle for `tag`, evicting dead sessions on the way.
    fn live_handle(&self, tag: ProtocolTag, origin: &Origin) -> Option<Handle> {
        let handle = self.inner.cache.get(tag, origin)?;
        if let Handle::Session(session) = &handle {
            if session.is_destroyed() || session.is_goaway() {
                self.inner.cache.remove(&handle);
                return None;
            }
        }
        Some(handle)
    }

    /// The funnel serializing establishment for one cache key. Locking
    /// consumes the clone so [`Self::release_funnel`] can prune by count.
    async fn funnel(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut funnels = self.inner.funnels.lock();
            Arc::clone(funnels.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    fn release_funnel(&self, key: &str) {
        let mut funnels = self.inner.funnels.lock();
        if let Some(lock) = funnels.get(key) {
            // Drop the map entry once nobody else is queued on it.
            if Arc::strong_count(lock) == 1 {
                funnels.remove(key);
            }
        }
    }

    async fn resolve_transport(
        &self,
        origin: &Origin,
        state: &Snapshot,
        http1_config: &Http1Config,
    ) -> Result<Transport> {
        match origin.scheme() {
            Scheme::Http => match state.config.http_protocol.resolve(origin) {
                Alpn::Http1 => self.resolve_cleartext_h1(origin, http1_config).await,
                Alpn::Http2 => self.resolve_cleartext_h2(origin, http1_config).await,
            },
            Scheme::Https => self.resolve_tls(origin, state, http1_config).await,
        }
    }

    async fn resolve_cleartext_h1(
        &self,
        origin: &Origin,
        http1_config: &Http1Config,
    ) -> Result<Transport> {
        let tag = ProtocolTag::Http1;
        if let Some(Handle::Pool(pool)) = self.live_handle(tag, origin) {
            return Ok(Transport::H1 { pool, pre: None });
        }
        let key = format!("{tag}:{origin}");
        let guard = self.funnel(&key).await;
        if let Some(Handle::Pool(pool)) = self.live_handle(tag, origin) {
            drop(guard);
            self.release_funnel(&key);
            return Ok(Transport::H1 { pool, pre: None });
        }

        // The pool starts empty; sockets are dialed on demand under its
        // capacity accounting, so registering the entry is all it takes.
        let pool = new_pool(http1_config);
        let cleanup = {
            let pool = pool.clone();
            move || pool.disconnect_all()
        };
        self.inner
            .cache
            .insert(origin, tag, Handle::Pool(pool.clone()), &[], cleanup);
        debug!(origin = %origin, "http1 pool registered");
        drop(guard);
        self.release_funnel(&key);
        Ok(Transport::H1 { pool, pre: None })
    }

    async fn resolve_cleartext_h2(
        &self,
        origin: &Origin,
        http1_config: &Http1Config,
    ) -> Result<Transport> {
        let tag = ProtocolTag::Http2;
        if let Some(Handle::Session(session)) = self.live_handle(tag, origin) {
            return Ok(Transport::H2(session));
        }
        let key = format!("{tag}:{origin}");
        let guard = self.funnel(&key).await;
        if let Some(Handle::Session(session)) = self.live_handle(tag, origin) {
            drop(guard);
            self.release_funnel(&key);
            return Ok(Transport::H2(session));
        }

        let result = async {
            let tcp = self.dial(origin, http1_config.socket_timeout).await?;
            let session = self
                .inner
                .sessions
                .create_session(tcp, origin.clone())
                .await?;
            let cleanup = {
                let session = Arc::clone(&session);
                move || session.destroy()
            };
            self.inner
                .cache
                .insert(origin, tag, Handle::Session(Arc::clone(&session)), &[], cleanup);
            Ok(Transport::H2(session))
        }
        .await;
        drop(guard);
        self.release_funnel(&key);
        result
    }

    /// Establish over TLS: one handshake decides the protocol via ALPN, and
    /// the result is cached under the negotiated tag together with the
    /// certificate's alternative names.
    async fn resolve_tls(
        &self,
        origin: &Origin,
        state: &Snapshot,
        http1_config: &Http1Config,
    ) -> Result<Transport> {
        if let Some(transport) = self.cached_tls(origin) {
            return Ok(transport);
        }
        let key = format!("https:{origin}");
        let guard = self.funnel(&key).await;
        if let Some(transport) = self.cached_tls(origin) {
            drop(guard);
            self.release_funnel(&key);
            return Ok(transport);
        }

        let result = async {
            let protocols = state.config.https_protocols.resolve(origin);
            let negotiator =
                TlsNegotiator::new(Arc::clone(&state.tls), http1_config.socket_timeout);
            let negotiated = negotiator
                .connect(origin.host(), origin.port(), &protocols)
                .await?;

            match negotiated.alpn {
                Alpn::Http2 => {
                    let session = self
                        .inner
                        .sessions
                        .create_session(negotiated.io, origin.clone())
                        .await?;
                    let cleanup = {
                        let session = Arc::clone(&session);
                        move || session.destroy()
                    };
                    self.inner.cache.insert(
                        origin,
                        ProtocolTag::Https2,
                        Handle::Session(Arc::clone(&session)),
                        &negotiated.alt_names,
                        cleanup,
                    );
                    Ok(Transport::H2(session))
                }
                Alpn::Http1 => {
                    let pool = new_pool(http1_config);
                    let cleanup = {
                        let pool = pool.clone();
                        move || pool.disconnect_all()
                    };
                    self.inner.cache.insert(
                        origin,
                        ProtocolTag::Https1,
                        Handle::Pool(pool.clone()),
                        &negotiated.alt_names,
                        cleanup,
                    );
                    // Seed the pool with the socket we just negotiated,
                    // checked out for the requesting fetch.
                    let conn = http1::handshake(negotiated.io).await?;
                    let pre = match pool.acquire().await? {
                        Acquired::Connect(permit) => Some(permit.register(conn)),
                        // The pool is brand new; nothing can be idle.
                        Acquired::Reused(pre) => Some(pre),
                    };
                    Ok(Transport::H1 { pool, pre })
                }
            }
        }
        .await;
        drop(guard);
        self.release_funnel(&key);
        result
    }

    /// A live TLS handle under either negotiated protocol.
    fn cached_tls(&self, origin: &Origin) -> Option<Transport> {
        match self.live_handle(ProtocolTag::Https2, origin) {
            Some(Handle::Session(session)) => return Some(Transport::H2(session)),
            Some(handle @ Handle::Pool(_)) => {
                // A pool cached under the h2 tag is a bug; drop it.
                self.inner.cache.remove(&handle);
            }
            None => {}
        }
        match self.live_handle(ProtocolTag::Https1, origin)? {
            Handle::Pool(pool) => Some(Transport::H1 { pool, pre: None }),
            handle @ Handle::Session(_) => {
                self.inner.cache.remove(&handle);
                None
            }
        }
    }

    async fn dial(&self, origin: &Origin, timeout: Option<Duration>) -> Result<TcpStream> {
        let connect = async {
            trace!(host = origin.host(), port = origin.port(), "dialing");
            let tcp = TcpStream::connect((origin.host(), origin.port())).await?;
            tcp.set_nodelay(true)?;
            Ok(tcp)
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| Error::Timeout(timeout))?,
            None => connect.await,
        }
    }
}

fn new_pool(config: &Http1Config) -> Http1Pool<H1Socket> {
    Http1Pool::new(
        config.max_sockets,
        config.effective_max_free_sockets(),
        config.keep_alive_timeout,
    )
}

/// Outcome of one attempt, driving the fetch loop.
enum Attempt {
    Done(Response),
    Redirect(Uri),
}

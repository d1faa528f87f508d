//! HTTP/2 session lifecycle.
//!
//! One [`H2Session`] multiplexes every request to an origin. Sessions are
//! reference counted by in-flight exchanges; a GOAWAY evicts the session from
//! the cache into a stale set where it finishes its remaining streams before
//! being torn down. Server push promises are surfaced to a registered
//! handler.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::body::Body;
use crate::decode::DecoderSet;
use crate::error::Result;
use crate::origin::Origin;
use crate::response::Response;

/// An established HTTP/2 session to one origin.
///
/// Holds the stream handle together with the bookkeeping the manager needs:
/// a reference count of live exchanges and the goaway/destroyed flags.
pub(crate) struct H2Session {
    id: u64,
    origin: Origin,
    sender: h2::client::SendRequest<Bytes>,
    refs: AtomicUsize,
    goaway: AtomicBool,
    destroyed: AtomicBool,
    idle: tokio::sync::Notify,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for H2Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Session")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("refs", &self.refs.load(Ordering::SeqCst))
            .field("goaway", &self.goaway.load(Ordering::SeqCst))
            .field("destroyed", &self.destroyed.load(Ordering::SeqCst))
            .finish()
    }
}

impl H2Session {
    /// A fresh stream handle for one request.
    pub(crate) fn sender(&self) -> h2::client::SendRequest<Bytes> {
        self.sender.clone()
    }

    pub(crate) fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Take a reference for an in-flight exchange. No-op once destroyed.
    fn ref_(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop an exchange reference. Saturates at zero; the 1→0 transition
    /// wakes the drain task.
    fn unref(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let prev = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if prev == Ok(1) {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn mark_goaway(&self) {
        self.goaway.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_goaway(&self) -> bool {
        self.goaway.load(Ordering::SeqCst)
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Tear the session down: no new refs, connection driver shut down.
    pub(crate) fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!(id = self.id, origin = %self.origin, "destroying session");
        let _ = self.shutdown.send(true);
        self.idle.notify_waiters();
    }

    /// Resolves once no exchange holds a reference.
    async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            if self.refs.load(Ordering::SeqCst) == 0 || self.is_destroyed() {
                return;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

/// RAII exchange reference to a session.
pub(crate) struct SessionRef {
    session: Arc<H2Session>,
}

impl SessionRef {
    pub(crate) fn new(session: Arc<H2Session>) -> Self {
        session.ref_();
        Self { session }
    }
}

impl Clone for SessionRef {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.session))
    }
}

impl std::ops::Deref for SessionRef {
    type Target = H2Session;

    fn deref(&self) -> &H2Session {
        &self.session
    }
}

impl Drop for SessionRef {
    fn drop(&mut self) {
        self.session.unref();
    }
}

impl std::fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.session.fmt(f)
    }
}

/// A pushed exchange handed to the [`PushHandler`].
///
/// Carries the request the server promised to answer and resolves to the
/// pushed response once its headers arrive. The session stays referenced for
/// as long as the push (or its body) is alive.
pub struct ServerPush {
    request: http::Request<()>,
    response: h2::client::PushedResponseFuture,
    session: SessionRef,
    decoders: DecoderSet,
}

impl std::fmt::Debug for ServerPush {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPush")
            .field("request", &self.request)
            .finish()
    }
}

impl ServerPush {
    /// The synthesized request the server promised to fulfil.
    pub fn request(&self) -> &http::Request<()> {
        &self.request
    }

    /// Wait for the pushed response headers.
    pub async fn response(self) -> Result<Response> {
        let url = self.request.uri().clone();
        let (parts, recv) = self.response.await?.into_parts();
        let body = Body::h2_guarded(recv, self.session);
        Ok(Response::new(parts, body, url, false, self.decoders))
    }
}

/// Callback invoked for every accepted server push.
pub type PushHandler = Arc<dyn Fn(ServerPush) + Send + Sync>;

struct ManagerInner {
    next_id: AtomicU64,
    /// GOAWAY'd sessions waiting for their in-flight streams to finish.
    stale: Mutex<Vec<Arc<H2Session>>>,
    push_handler: Mutex<Option<PushHandler>>,
}

/// Creates, quarantines, and drains HTTP/2 sessions.
#[derive(Clone)]
pub(crate) struct Http2SessionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for Http2SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2SessionManager")
            .field("stale", &self.inner.stale.lock().len())
            .finish()
    }
}

impl Http2SessionManager {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                next_id: AtomicU64::new(0),
                stale: Mutex::new(Vec::new()),
                push_handler: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn set_push_handler(&self, handler: Option<PushHandler>) {
        *self.inner.push_handler.lock() = handler;
    }

    /// Handshake a new session over `io` and spawn its connection driver.
    ///
    /// The returned reference is the creator's; the session dies naturally
    /// when the driver completes.
    pub(crate) async fn create_session<T>(&self, io: T, origin: Origin) -> Result<Arc<H2Session>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, connection) = h2::client::Builder::new()
            .enable_push(true)
            .handshake(io)
            .await?;
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let session = Arc::new(H2Session {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            origin,
            sender,
            refs: AtomicUsize::new(0),
            goaway: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            idle: tokio::sync::Notify::new(),
            shutdown,
        });
        debug!(id = session.id, origin = %session.origin, "session established");

        let weak = Arc::downgrade(&session);
        tokio::spawn(async move {
            tokio::select! {
                result = connection => {
                    if let Err(error) = result {
                        debug!(%error, "session connection ended");
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
            if let Some(session) = weak.upgrade() {
                session.mark_goaway();
                session.destroy();
            }
        });

        Ok(session)
    }

    pub(crate) fn acquire(&self, session: &Arc<H2Session>) -> SessionRef {
        SessionRef::new(Arc::clone(session))
    }

    /// Move a GOAWAY'd session to the stale set and drain it asynchronously:
    /// streams already in flight complete, then the session closes.
    pub(crate) fn quarantine(&self, session: Arc<H2Session>) {
        session.mark_goaway();
        {
            let mut stale = self.inner.stale.lock();
            if stale.iter().any(|s| Arc::ptr_eq(s, &session)) {
                return;
            }
            stale.push(Arc::clone(&session));
        }
        debug!(id = session.id, origin = %session.origin, "session quarantined");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            session.drained().await;
            session.destroy();
            inner.stale.lock().retain(|s| !Arc::ptr_eq(s, &session));
        });
    }

    /// Watch a response future for push promises, dispatching each to the
    /// registered handler. Promises arriving with no handler are dropped,
    /// which resets the pushed stream.
    pub(crate) fn dispatch_pushes(
        &self,
        response: &mut h2::client::ResponseFuture,
        session: SessionRef,
        decoders: DecoderSet,
    ) {
        let mut promises = response.push_promises();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(promise) = promises.push_promise().await {
                let promise = match promise {
                    Ok(promise) => promise,
                    Err(error) => {
                        trace!(%error, "push promise stream ended");
                        break;
                    }
                };
                // The handler can be registered or swapped at any time;
                // consult it per promise.
                let handler = inner.push_handler.lock().clone();
                let Some(handler) = handler else {
                    trace!("push promise dropped, no handler registered");
                    continue;
                };
                let (request, response) = promise.into_parts();
                trace!(uri = %request.uri(), "dispatching server push");
                handler(ServerPush {
                    request,
                    response,
                    session: session.clone(),
                    decoders: decoders.clone(),
                });
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn stale_len(&self) -> usize {
        self.inner.stale.lock().len()
    }
}

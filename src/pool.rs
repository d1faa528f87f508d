//! Per-origin HTTP/1.1 socket pool.
//!
//! Sockets are either checked out (`used`) or parked (`idle`), never both.
//! When every socket is in use and `max_sockets` has been reached, acquirers
//! queue as waiters and are handed a socket directly when one is released.
//! Releasing past `max_free_sockets` closes the socket instead of parking it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pin_project::pin_project;
use tokio::sync::oneshot::{self, Receiver, Sender};
use tracing::trace;

use crate::error::{Error, Result};

/// A force-close hook for a socket the pool no longer holds directly.
#[derive(Clone)]
pub(crate) struct CloseHandle(Arc<dyn Fn() + Send + Sync>);

impl CloseHandle {
    pub(crate) fn new(close: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(close))
    }

    fn close(&self) {
        (self.0)();
    }
}

impl std::fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CloseHandle")
    }
}

/// A socket the pool can park and hand between requests.
pub(crate) trait PoolableConnection: Send + 'static {
    /// Whether the underlying transport is still usable.
    fn is_open(&self) -> bool;

    /// A handle that tears the transport down even while checked out.
    fn close_handle(&self) -> CloseHandle;
}

enum WaiterMsg<C> {
    Socket(u64, C),
    Disconnected,
}

struct IdleEntry<C> {
    id: u64,
    conn: C,
    close: CloseHandle,
    at: Instant,
}

struct PoolInner<C> {
    max_sockets: usize,
    max_free_sockets: usize,
    keep_alive_timeout: Option<Duration>,
    next_id: u64,
    /// Checked-out sockets, by id. The pool keeps only the close hook.
    used: HashMap<u64, CloseHandle>,
    /// Issued connect permits not yet registered.
    connecting: usize,
    idle: Vec<IdleEntry<C>>,
    waiters: VecDeque<Sender<WaiterMsg<C>>>,
}

impl<C: PoolableConnection> PoolInner<C> {
    fn total(&self) -> usize {
        self.used.len() + self.connecting + self.idle.len()
    }

    /// Pop an open idle socket, discarding closed or expired ones.
    fn pop_idle(&mut self) -> Option<(u64, C)> {
        let expired_before = self
            .keep_alive_timeout
            .and_then(|timeout| Instant::now().checked_sub(timeout));
        while let Some(entry) = self.idle.pop() {
            if expired_before.map(|cutoff| entry.at < cutoff).unwrap_or(false) {
                trace!(id = entry.id, "dropping expired idle socket");
                entry.close.close();
                continue;
            }
            if entry.conn.is_open() {
                self.used.insert(entry.id, entry.close);
                return Some((entry.id, entry.conn));
            }
            trace!(id = entry.id, "dropping closed idle socket");
        }
        None
    }

    /// Return a released socket: first live waiter wins, otherwise park or
    /// close it depending on free capacity.
    fn release(&mut self, id: u64, conn: C) {
        let Some(close) = self.used.remove(&id) else {
            // disconnect_all already claimed this socket.
            close_now(&conn);
            return;
        };
        if !conn.is_open() {
            return;
        }
        let mut conn = conn;
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            match waiter.send(WaiterMsg::Socket(id, conn)) {
                Ok(()) => {
                    trace!(id, "socket handed to waiter");
                    self.used.insert(id, close);
                    return;
                }
                Err(WaiterMsg::Socket(_, returned)) => conn = returned,
                Err(WaiterMsg::Disconnected) => unreachable!(),
            }
        }
        if self.idle.len() >= self.max_free_sockets {
            trace!(id, "closing released socket, idle set full");
            close.close();
            return;
        }
        trace!(id, "parking released socket");
        self.idle.push(IdleEntry {
            id,
            conn,
            close,
            at: Instant::now(),
        });
    }

    /// A connect permit was dropped without producing a socket. Capacity
    /// opened up, so one waiter is abandoned and retries acquisition.
    fn cancel_permit(&mut self) {
        self.connecting = self.connecting.saturating_sub(1);
        while let Some(waiter) = self.waiters.pop_front() {
            if !waiter.is_closed() {
                drop(waiter);
                break;
            }
        }
    }
}

fn close_now<C: PoolableConnection>(conn: &C) {
    conn.close_handle().close();
}

/// Pool of HTTP/1.1 sockets for a single origin.
pub(crate) struct Http1Pool<C: PoolableConnection> {
    inner: Arc<Mutex<PoolInner<C>>>,
}

impl<C: PoolableConnection> Clone for Http1Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: PoolableConnection> PartialEq for Http1Pool<C> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<C: PoolableConnection> std::fmt::Debug for Http1Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Http1Pool")
            .field("used", &inner.used.len())
            .field("connecting", &inner.connecting)
            .field("idle", &inner.idle.len())
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

/// Outcome of [`Http1Pool::acquire`].
pub(crate) enum Acquired<C: PoolableConnection> {
    /// An existing socket, ready to use.
    Reused(Pooled<C>),
    /// Capacity for a new socket; the caller connects and registers it.
    Connect(ConnectPermit<C>),
}

impl<C: PoolableConnection> Http1Pool<C> {
    pub(crate) fn new(
        max_sockets: usize,
        max_free_sockets: usize,
        keep_alive_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                max_sockets: max_sockets.max(1),
                max_free_sockets,
                keep_alive_timeout,
                next_id: 0,
                used: HashMap::new(),
                connecting: 0,
                idle: Vec::new(),
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Acquire a socket: reuse an idle one, get a connect permit, or wait.
    ///
    /// The check and the waiter enqueue happen under one lock, so a socket
    /// released concurrently always reaches either the idle set or a queued
    /// waiter; abandonment (a cancelled permit) loops back into acquisition.
    pub(crate) async fn acquire(&self) -> Result<Acquired<C>> {
        loop {
            let waiting = {
                let mut inner = self.inner.lock();
                if let Some((id, conn)) = inner.pop_idle() {
                    return Ok(Acquired::Reused(Pooled::new(id, conn, &self.inner)));
                }
                if inner.total() < inner.max_sockets {
                    inner.connecting += 1;
                    return Ok(Acquired::Connect(ConnectPermit {
                        pool: Arc::downgrade(&self.inner),
                        consumed: false,
                    }));
                }
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                Waiting { rx }
            };
            match waiting.await {
                WaitOutcome::Socket(id, conn) => {
                    return Ok(Acquired::Reused(Pooled::new(id, conn, &self.inner)))
                }
                WaitOutcome::Abandoned => continue,
                WaitOutcome::Disconnected => return Err(Error::Disconnected),
            }
        }
    }

    /// Close every socket and reject queued waiters.
    pub(crate) fn disconnect_all(&self) {
        let mut inner = self.inner.lock();
        for close in inner.used.values() {
            close.close();
        }
        inner.used.clear();
        for entry in inner.idle.drain(..) {
            entry.close.close();
        }
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(WaiterMsg::Disconnected);
        }
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock();
        (inner.used.len(), inner.connecting, inner.idle.len())
    }
}

/// Permission to open one new socket without exceeding `max_sockets`.
#[derive(Debug)]
pub(crate) struct ConnectPermit<C: PoolableConnection> {
    pool: Weak<Mutex<PoolInner<C>>>,
    consumed: bool,
}

impl<C: PoolableConnection> ConnectPermit<C> {
    /// Hand the freshly connected socket to the pool, checked out to the
    /// caller.
    pub(crate) fn register(mut self, conn: C) -> Pooled<C> {
        self.consumed = true;
        let Some(pool) = self.pool.upgrade() else {
            let id = 0;
            return Pooled {
                id,
                conn: Some(conn),
                pool: Weak::new(),
            };
        };
        let mut inner = pool.lock();
        inner.connecting = inner.connecting.saturating_sub(1);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.used.insert(id, conn.close_handle());
        drop(inner);
        Pooled {
            id,
            conn: Some(conn),
            pool: Arc::downgrade(&pool),
        }
    }
}

impl<C: PoolableConnection> Drop for ConnectPermit<C> {
    fn drop(&mut self) {
        if !self.consumed {
            if let Some(pool) = self.pool.upgrade() {
                pool.lock().cancel_permit();
            }
        }
    }
}

/// Checked-out socket; dropping it releases the socket back to the pool.
pub(crate) struct Pooled<C: PoolableConnection> {
    id: u64,
    conn: Option<C>,
    pool: Weak<Mutex<PoolInner<C>>>,
}

impl<C: PoolableConnection> Pooled<C> {
    fn new(id: u64, conn: C, pool: &Arc<Mutex<PoolInner<C>>>) -> Self {
        Self {
            id,
            conn: Some(conn),
            pool: Arc::downgrade(pool),
        }
    }
}

impl<C: PoolableConnection + std::fmt::Debug> std::fmt::Debug for Pooled<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pooled").field(&self.conn).finish()
    }
}

impl<C: PoolableConnection> Deref for Pooled<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("socket taken")
    }
}

impl<C: PoolableConnection> DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("socket taken")
    }
}

impl<C: PoolableConnection> Drop for Pooled<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.lock().release(self.id, conn);
            }
        }
    }
}

enum WaitOutcome<C> {
    Socket(u64, C),
    Abandoned,
    Disconnected,
}

/// Resolves when a released socket is handed over, a permit slot opens, or
/// the pool is drained.
#[pin_project]
struct Waiting<C> {
    #[pin]
    rx: Receiver<WaiterMsg<C>>,
}

impl<C> Future for Waiting<C> {
    type Output = WaitOutcome<C>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().rx.poll(cx) {
            Poll::Ready(Ok(WaiterMsg::Socket(id, conn))) => {
                Poll::Ready(WaitOutcome::Socket(id, conn))
            }
            Poll::Ready(Ok(WaiterMsg::Disconnected)) => Poll::Ready(WaitOutcome::Disconnected),
            Poll::Ready(Err(_)) => Poll::Ready(WaitOutcome::Abandoned),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

    use super::*;

    static IDENT: AtomicU16 = AtomicU16::new(1);

    #[derive(Debug)]
    struct MockSocket {
        open: Arc<AtomicBool>,
        ident: u16,
    }

    impl MockSocket {
        fn new() -> Self {
            Self {
                open: Arc::new(AtomicBool::new(true)),
                ident: IDENT.fetch_add(1, Ordering::SeqCst),
            }
        }
    }

    impl PoolableConnection for MockSocket {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn close_handle(&self) -> CloseHandle {
            let open = Arc::clone(&self.open);
            CloseHandle::new(move || open.store(false, Ordering::SeqCst))
        }
    }

    async fn connect(pool: &Http1Pool<MockSocket>) -> Pooled<MockSocket> {
        match pool.acquire().await.unwrap() {
            Acquired::Connect(permit) => permit.register(MockSocket::new()),
            Acquired::Reused(_) => panic!("expected a connect permit"),
        }
    }

    #[tokio::test]
    async fn released_socket_is_reused() {
        let pool = Http1Pool::new(2, 2, None);
        let socket = connect(&pool).await;
        let ident = socket.ident;
        drop(socket);
        match pool.acquire().await.unwrap() {
            Acquired::Reused(socket) => assert_eq!(socket.ident, ident),
            Acquired::Connect(_) => panic!("expected the parked socket"),
        }
    }

    #[tokio::test]
    async fn closed_idle_sockets_are_skipped() {
        let pool = Http1Pool::new(2, 2, None);
        let socket = connect(&pool).await;
        socket.open.store(false, Ordering::SeqCst);
        drop(socket);
        assert!(matches!(
            pool.acquire().await.unwrap(),
            Acquired::Connect(_)
        ));
    }

    #[tokio::test]
    async fn saturation_queues_and_handoff_bypasses_idle() {
        let pool = Http1Pool::new(1, 1, None);
        let socket = connect(&pool).await;
        let ident = socket.ident;

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });
        tokio::task::yield_now().await;

        drop(socket);
        let handed = match waiter.await.unwrap().unwrap() {
            Acquired::Reused(socket) => socket,
            Acquired::Connect(_) => panic!("waiter should receive the released socket"),
        };
        assert_eq!(handed.ident, ident);
        // Handed directly to the waiter, never parked.
        let (used, _, idle) = pool.counts();
        assert_eq!((used, idle), (1, 0));
        drop(handed);
    }

    #[tokio::test]
    async fn release_past_max_free_sockets_closes() {
        let pool = Http1Pool::new(3, 1, None);
        let a = connect(&pool).await;
        let b = connect(&pool).await;
        let b_open = Arc::clone(&b.open);
        drop(a);
        drop(b);
        let (_, _, idle) = pool.counts();
        assert_eq!(idle, 1);
        assert!(!b_open.load(Ordering::SeqCst), "overflow socket closed");
    }

    #[tokio::test]
    async fn zero_free_sockets_never_parks() {
        let pool = Http1Pool::new(2, 0, None);
        let socket = connect(&pool).await;
        let open = Arc::clone(&socket.open);
        drop(socket);
        let (_, _, idle) = pool.counts();
        assert_eq!(idle, 0);
        assert!(!open.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_permit_reopens_capacity_for_waiter() {
        let pool = Http1Pool::<MockSocket>::new(1, 1, None);
        let permit = match pool.acquire().await.unwrap() {
            Acquired::Connect(permit) => permit,
            Acquired::Reused(_) => panic!(),
        };

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });
        tokio::task::yield_now().await;

        drop(permit);
        assert!(matches!(
            waiter.await.unwrap().unwrap(),
            Acquired::Connect(_)
        ));
    }

    #[tokio::test]
    async fn disconnect_all_closes_and_rejects_waiters() {
        let pool = Http1Pool::new(1, 1, None);
        let socket = connect(&pool).await;
        let open = Arc::clone(&socket.open);

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });
        tokio::task::yield_now().await;

        pool.disconnect_all();
        assert!(!open.load(Ordering::SeqCst), "checked-out socket closed");
        assert!(matches!(
            waiter.await.unwrap(),
            Err(Error::Disconnected)
        ));

        // Returning the closed socket does not resurrect it.
        drop(socket);
        let (used, _, idle) = pool.counts();
        assert_eq!((used, idle), (0, 0));
    }

    #[tokio::test]
    async fn expired_idle_socket_is_closed_on_acquire() {
        let pool = Http1Pool::new(1, 1, Some(Duration::from_millis(10)));
        let socket = connect(&pool).await;
        let open = Arc::clone(&socket.open);
        drop(socket);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(
            pool.acquire().await.unwrap(),
            Acquired::Connect(_)
        ));
        assert!(!open.load(Ordering::SeqCst));
    }
}

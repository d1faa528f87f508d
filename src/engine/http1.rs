//! HTTP/1.1 request execution over pooled sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http::header::{self, HeaderValue};
use http::StatusCode;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::body::Body;
use crate::error::{Error, Result};
use crate::origin::Origin;
use crate::pool::{CloseHandle, PoolableConnection};

/// One HTTP/1.1 socket: the hyper send handle plus a force-close hook for
/// the pool.
pub(crate) struct H1Socket {
    sender: http1::SendRequest<Body>,
    open: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for H1Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1Socket")
            .field("open", &self.is_open())
            .finish()
    }
}

impl PoolableConnection for H1Socket {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.sender.is_closed()
    }

    fn close_handle(&self) -> CloseHandle {
        let open = Arc::clone(&self.open);
        let shutdown = self.shutdown.clone();
        CloseHandle::new(move || {
            open.store(false, Ordering::SeqCst);
            let _ = shutdown.send(true);
        })
    }
}

/// Handshake HTTP/1.1 over `io` and spawn the connection driver.
pub(crate) async fn handshake<T>(io: T) -> Result<H1Socket>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http1::Builder::new()
        .handshake::<_, Body>(TokioIo::new(io))
        .await?;
    let open = Arc::new(AtomicBool::new(true));
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let driver_open = Arc::clone(&open);
    tokio::spawn(async move {
        tokio::select! {
            result = connection => {
                if let Err(error) = result {
                    debug!(%error, "http1 connection ended");
                }
            }
            _ = shutdown_rx.changed() => {
                trace!("http1 connection force-closed");
            }
        }
        driver_open.store(false, Ordering::SeqCst);
    });

    Ok(H1Socket {
        sender,
        open,
        shutdown,
    })
}

/// Send one request over `socket` and await the response head.
///
/// The request URI is rewritten to origin-form and `host` is pinned to the
/// origin, as required on a direct (non-proxy) connection.
pub(crate) async fn execute(
    socket: &mut H1Socket,
    origin: &Origin,
    mut request: http::Request<Body>,
) -> Result<http::Response<hyper::body::Incoming>> {
    *request.uri_mut() = super::origin_form(request.uri());
    if !request.headers().contains_key(header::HOST) {
        request.headers_mut().insert(
            header::HOST,
            HeaderValue::from_str(&origin.authority())
                .map_err(|_| Error::fetch("origin is not a valid host header"))?,
        );
    }

    socket.sender.ready().await?;
    trace!(method = %request.method(), uri = %request.uri(), "sending http1 request");
    let response = socket.sender.send_request(request).await?;
    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::UpgradeNotSupported);
    }
    Ok(response)
}


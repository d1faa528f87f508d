//! Abort signalling for in-flight requests.
//!
//! Mirrors the browser `AbortController`/`AbortSignal` pair: the controller
//! side fires once, every clone of the signal observes it, and a signal that
//! was already aborted fails the request before any I/O happens.

use tokio::sync::watch;

/// The firing half of an abort pair.
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

/// A cloneable handle observed by requests; resolves when aborted.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortController {
    /// Create a controller and its signal.
    pub fn new() -> (Self, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, AbortSignal { rx })
    }

    /// Fire the signal. Idempotent.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    /// A new signal tied to this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl AbortSignal {
    /// True once the controller has fired.
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the signal fires. Resolves immediately if it already has.
    ///
    /// Dropping the controller without aborting leaves this pending forever,
    /// which is what a request race wants: the other branches win.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                // Controller dropped without firing; park forever.
                std::future::pending::<()>().await;
            }
            if *rx.borrow() {
                return;
            }
        }
    }
}

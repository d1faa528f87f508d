//! Request and response bodies.
//!
//! [`Body`] wraps the different body sources this client deals with (static
//! bytes going out, hyper and h2 streams coming in) behind one
//! [`http_body::Body`] implementation.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Opaque owner keeping an HTTP/1 socket checked out of its pool while the
/// response body is read.
pub(crate) type SocketGuard = Box<dyn std::any::Any + Send>;

/// A body for requests and responses.
#[pin_project::pin_project]
pub struct Body {
    #[pin]
    inner: InnerBody,
}

#[pin_project::pin_project(project = InnerBodyProj)]
enum InnerBody {
    Empty,
    Full(#[pin] http_body_util::Full<Bytes>),
    Incoming(#[pin] hyper::body::Incoming, Option<SocketGuard>),
    H2(#[pin] H2Body),
    Boxed(#[pin] BoxBody<Bytes, BoxError>),
}

impl Body {
    /// Create an empty body.
    pub fn empty() -> Self {
        Self {
            inner: InnerBody::Empty,
        }
    }

    /// Create a body from anything convertible into [`Bytes`].
    pub fn full<D>(data: D) -> Self
    where
        D: Into<Bytes>,
    {
        Self {
            inner: InnerBody::Full(http_body_util::Full::new(data.into())),
        }
    }

    /// Wrap an arbitrary body.
    pub fn boxed<B>(body: B) -> Self
    where
        B: HttpBody<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            inner: InnerBody::Boxed(BoxBody::new(body.map_err(Into::into))),
        }
    }

    /// A hyper body that keeps its socket checked out until the body is
    /// dropped, so pool maintenance cannot close it mid-read.
    pub(crate) fn incoming_guarded(body: hyper::body::Incoming, guard: SocketGuard) -> Self {
        Self {
            inner: InnerBody::Incoming(body, Some(guard)),
        }
    }

    /// An h2 body that keeps `guard`'s session referenced until the body is
    /// dropped.
    pub(crate) fn h2_guarded(recv: h2::RecvStream, guard: crate::session::SessionRef) -> Self {
        Self {
            inner: InnerBody::H2(H2Body::new(recv, guard)),
        }
    }

    /// True when the body is known to be empty.
    pub fn is_empty(&self) -> bool {
        match &self.inner {
            InnerBody::Empty => true,
            InnerBody::Full(full) => HttpBody::size_hint(full).exact() == Some(0),
            _ => false,
        }
    }

    /// The exact body length, when known up front.
    pub fn content_length(&self) -> Option<u64> {
        HttpBody::size_hint(self).exact()
    }

    /// Clone this body when the underlying data allows it.
    ///
    /// Streaming bodies cannot be replayed, which is why non-GET/HEAD
    /// redirects are unsupported.
    pub fn try_clone(&self) -> Option<Self> {
        match &self.inner {
            InnerBody::Empty => Some(Self::empty()),
            InnerBody::Full(full) => Some(Self {
                inner: InnerBody::Full(full.clone()),
            }),
            _ => None,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner {
            InnerBody::Empty => "Empty",
            InnerBody::Full(_) => "Full",
            InnerBody::Incoming(..) => "Incoming",
            InnerBody::H2(_) => "H2",
            InnerBody::Boxed(_) => "Boxed",
        };
        f.debug_tuple("Body").field(&kind).finish()
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Self::full(data)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Self::full(data)
    }
}

impl From<String> for Body {
    fn from(data: String) -> Self {
        Self::full(data)
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Self::full(data)
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project().inner.project() {
            InnerBodyProj::Empty => Poll::Ready(None),
            InnerBodyProj::Full(full) => full.poll_frame(cx).map_err(|never| match never {}),
            InnerBodyProj::Incoming(incoming, _) => incoming.poll_frame(cx).map_err(Into::into),
            InnerBodyProj::H2(h2) => h2.poll_frame(cx).map_err(Into::into),
            InnerBodyProj::Boxed(boxed) => boxed.poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            InnerBody::Empty => true,
            InnerBody::Full(full) => full.is_end_stream(),
            InnerBody::Incoming(incoming, _) => incoming.is_end_stream(),
            InnerBody::H2(h2) => h2.is_end_stream(),
            InnerBody::Boxed(boxed) => boxed.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            InnerBody::Empty => SizeHint::with_exact(0),
            InnerBody::Full(full) => HttpBody::size_hint(full),
            InnerBody::Incoming(incoming, _) => HttpBody::size_hint(incoming),
            InnerBody::H2(h2) => h2.size_hint(),
            InnerBody::Boxed(boxed) => HttpBody::size_hint(boxed),
        }
    }
}

/// An h2 receive stream adapted to [`http_body::Body`].
///
/// Data frames release their flow-control capacity as they are yielded, and
/// the final trailers frame is surfaced after the data ends.
struct H2Body {
    recv: h2::RecvStream,
    data_done: bool,
    _guard: crate::session::SessionRef,
}

impl H2Body {
    fn new(recv: h2::RecvStream, guard: crate::session::SessionRef) -> Self {
        Self {
            recv,
            data_done: false,
            _guard: guard,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.recv.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

impl HttpBody for H2Body {
    type Data = Bytes;
    type Error = h2::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if !this.data_done {
            match this.recv.poll_data(cx) {
                Poll::Ready(Some(Ok(data))) => {
                    let _ = this.recv.flow_control().release_capacity(data.len());
                    return Poll::Ready(Some(Ok(Frame::data(data))));
                }
                Poll::Ready(Some(Err(error))) => return Poll::Ready(Some(Err(error))),
                Poll::Ready(None) => this.data_done = true,
                Poll::Pending => return Poll::Pending,
            }
        }

        match this.recv.poll_trailers(cx) {
            Poll::Ready(Ok(Some(trailers))) => Poll::Ready(Some(Ok(Frame::trailers(trailers)))),
            Poll::Ready(Ok(None)) => Poll::Ready(None),
            Poll::Ready(Err(error)) => Poll::Ready(Some(Err(error))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.recv.is_end_stream()
    }
}

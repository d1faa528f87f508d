//! HTTP/2 request execution over shared sessions.

use bytes::Bytes;
use http_body_util::BodyExt;
use tracing::trace;

use crate::body::Body;
use crate::decode::DecoderSet;
use crate::error::{Error, Result};
use crate::session::{Http2SessionManager, SessionRef};

/// Send one request over `session` and await the response head.
///
/// The request body is buffered and streamed under h2 flow control. Push
/// promises attached to the response are handed to the session manager for
/// dispatch before the response head resolves.
pub(crate) async fn execute(
    session: &SessionRef,
    manager: &Http2SessionManager,
    decoders: &DecoderSet,
    request: http::Request<Body>,
) -> Result<http::Response<Body>> {
    let (parts, body) = request.into_parts();
    let outgoing = body.collect().await.map_err(Error::from_body)?.to_bytes();
    let end_of_stream = outgoing.is_empty();
    let request = http::Request::from_parts(parts, ());

    let mut sender = session.sender().ready().await?;
    trace!(method = %request.method(), uri = %request.uri(), "sending http2 request");
    let (mut response, stream) = sender.send_request(request, end_of_stream)?;

    manager.dispatch_pushes(&mut response, session.clone(), decoders.clone());

    if !end_of_stream {
        send_body(stream, outgoing).await?;
    }

    let (parts, recv) = response.await?.into_parts();
    let body = Body::h2_guarded(recv, session.clone());
    Ok(http::Response::from_parts(parts, body))
}

/// Stream `data` respecting the peer's flow-control window.
async fn send_body(mut stream: h2::SendStream<Bytes>, mut data: Bytes) -> Result<()> {
    const CHUNK: usize = 16 * 1024;
    while !data.is_empty() {
        stream.reserve_capacity(data.len().min(CHUNK));
        let granted = std::future::poll_fn(|cx| stream.poll_capacity(cx))
            .await
            .ok_or_else(|| Error::fetch("stream closed while sending the request body"))??;
        if granted == 0 {
            continue;
        }
        let chunk = data.split_to(granted.min(data.len()));
        let end = data.is_empty();
        stream.send_data(chunk, end)?;
    }
    Ok(())
}

/// Whether `error` looks like the stream lost a race against a GOAWAY the
/// session had not surfaced yet.
pub(crate) fn is_goaway_race(error: &Error, session_goaway: bool) -> bool {
    match error {
        Error::Http2(err) => {
            session_goaway
                || err.is_go_away()
                || err.reason() == Some(h2::Reason::REFUSED_STREAM)
        }
        _ => session_goaway,
    }
}

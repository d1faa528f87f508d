//! End-to-end HTTP/1.1 tests against a local hyper server.

use std::convert::Infallible;
use std::future::Future;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use fetchdriver::{
    AbortController, Client, Config, Error, Http1Config, RedirectMode, Request,
};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
type TestResponse = http::Response<Full<Bytes>>;

struct TestServer {
    base: String,
    connections: Arc<AtomicUsize>,
}

impl TestServer {
    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn url(&self, path: &str) -> Uri {
        format!("{}{path}", self.base).parse().unwrap()
    }
}

/// Serve `handler` over HTTP/1.1 on an ephemeral port, counting accepted
/// connections.
async fn start_server<H, F>(handler: H) -> TestServer
where
    H: Fn(http::Request<Incoming>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = TestResponse> + Send + 'static,
{
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    TestServer {
        base: format!("http://{addr}"),
        connections,
    }
}

fn ok_with(body: &str) -> TestResponse {
    http::Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(Bytes::from(body.to_owned())))
        .unwrap()
}

fn redirect_to(location: &str) -> TestResponse {
    http::Response::builder()
        .status(StatusCode::FOUND)
        .header(http::header::LOCATION, location)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[tokio::test]
async fn fetch_round_trip_applies_default_headers() -> Result<(), BoxError> {
    let server = start_server(|req| async move {
        let ua = req
            .headers()
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        http::Response::builder()
            .status(StatusCode::OK)
            .header("echo-user-agent", ua)
            .header("echo-host", host)
            .body(Full::new(Bytes::from_static(b"hello")))
            .unwrap()
    })
    .await;

    let client = Client::new();
    let response = client.fetch(Request::get(server.url("/"))).await?;

    assert_eq!(response.status(), StatusCode::OK);
    let ua = response.headers()["echo-user-agent"].to_str()?.to_owned();
    assert!(ua.starts_with("fetchdriver/"), "user-agent was {ua:?}");
    assert!(!response.headers()["echo-host"].is_empty());
    assert!(!response.redirected());
    assert_eq!(response.text().await?, "hello");
    Ok(())
}

#[tokio::test]
async fn keep_alive_reuses_the_socket() -> Result<(), BoxError> {
    let server = start_server(|_| async { ok_with("ok") }).await;
    let client = Client::new();

    for _ in 0..3 {
        let response = client.fetch(Request::get(server.url("/"))).await?;
        // Consuming the body releases the socket back to the pool.
        response.text().await?;
    }

    assert_eq!(server.connections(), 1);
    Ok(())
}

#[tokio::test]
async fn max_sockets_one_serializes_concurrent_fetches() -> Result<(), BoxError> {
    let server = start_server(|_| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ok_with("slow")
    })
    .await;

    let config = Config::builder()
        .http1(Http1Config {
            max_sockets: 1,
            ..Http1Config::default()
        })
        .build();
    let client = Client::with_config(config);

    let first = {
        let client = client.clone();
        let url = server.url("/");
        async move { client.fetch(Request::get(url)).await?.text().await }
    };
    let second = {
        let client = client.clone();
        let url = server.url("/");
        async move { client.fetch(Request::get(url)).await?.text().await }
    };
    let (a, b) = tokio::join!(first, second);
    assert_eq!(a?, "slow");
    assert_eq!(b?, "slow");

    assert_eq!(server.connections(), 1);
    Ok(())
}

#[tokio::test]
async fn redirects_are_followed_and_flagged() -> Result<(), BoxError> {
    let server = start_server(|req| async move {
        match req.uri().path() {
            "/start" => redirect_to("/next"),
            "/next" => redirect_to("/end"),
            "/end" => ok_with("arrived"),
            _ => ok_with("?"),
        }
    })
    .await;

    let client = Client::new();
    let response = client.fetch(Request::get(server.url("/start"))).await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.redirected());
    assert!(response.url().path().ends_with("/end"));
    assert_eq!(response.text().await?, "arrived");
    Ok(())
}

#[tokio::test]
async fn redirect_loops_are_detected() {
    let server = start_server(|req| async move {
        match req.uri().path() {
            "/a" => redirect_to("/b"),
            _ => redirect_to("/a"),
        }
    })
    .await;

    let client = Client::new();
    let err = client
        .fetch(Request::get(server.url("/a")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RedirectLoop { .. }), "got {err:?}");
}

#[tokio::test]
async fn manual_mode_returns_the_redirect_itself() -> Result<(), BoxError> {
    let server = start_server(|_| async { redirect_to("/elsewhere") }).await;

    let client = Client::new();
    let response = client
        .fetch(Request::get(server.url("/")).redirect(RedirectMode::Manual))
        .await?;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(!response.redirected());
    assert_eq!(response.headers()[http::header::LOCATION], "/elsewhere");
    Ok(())
}

#[tokio::test]
async fn timeout_budget_spans_redirect_hops() {
    let server = start_server(|req| async move {
        match req.uri().path() {
            "/hop" => redirect_to("/slow"),
            _ => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                ok_with("late")
            }
        }
    })
    .await;

    let client = Client::new();
    let err = client
        .fetch(Request::get(server.url("/hop")).timeout(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
}

#[tokio::test]
async fn abort_cancels_an_in_flight_fetch() {
    let server = start_server(|_| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        ok_with("late")
    })
    .await;

    let client = Client::new();
    let (controller, signal) = AbortController::new();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.abort();
    });

    let err = client
        .fetch(Request::get(server.url("/")).abort(signal))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Abort), "got {err:?}");
}

#[tokio::test]
async fn pre_aborted_fetch_never_dials() {
    let server = start_server(|_| async { ok_with("ok") }).await;

    let client = Client::new();
    let (controller, signal) = AbortController::new();
    controller.abort();

    let err = client
        .fetch(Request::get(server.url("/")).abort(signal))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Abort));
    assert_eq!(server.connections(), 0);
}

#[tokio::test]
async fn cookies_round_trip_and_are_stripped() -> Result<(), BoxError> {
    let server = start_server(|req| async move {
        match req.uri().path() {
            "/set" => http::Response::builder()
                .status(StatusCode::OK)
                .header(http::header::SET_COOKIE, "sid=abc123; Path=/")
                .body(Full::new(Bytes::new()))
                .unwrap(),
            _ => {
                let cookie = req
                    .headers()
                    .get(http::header::COOKIE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_owned();
                http::Response::builder()
                    .status(StatusCode::OK)
                    .header("echo-cookie", cookie)
                    .body(Full::new(Bytes::new()))
                    .unwrap()
            }
        }
    })
    .await;

    let client = Client::new();

    let response = client.fetch(Request::get(server.url("/set"))).await?;
    assert!(response.headers().get(http::header::SET_COOKIE).is_none());
    response.text().await?;

    let response = client.fetch(Request::get(server.url("/echo"))).await?;
    assert_eq!(response.headers()["echo-cookie"], "sid=abc123");
    response.text().await?;

    // Opting in exposes the raw header.
    let response = client
        .fetch(Request::get(server.url("/set")).expose_set_cookie(true))
        .await?;
    assert_eq!(
        response.headers()[http::header::SET_COOKIE],
        "sid=abc123; Path=/"
    );
    Ok(())
}

#[tokio::test]
async fn request_cookies_are_sent_verbatim() -> Result<(), BoxError> {
    let server = start_server(|req| async move {
        let cookie = req
            .headers()
            .get(http::header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        http::Response::builder()
            .status(StatusCode::OK)
            .header("echo-cookie", cookie)
            .body(Full::new(Bytes::new()))
            .unwrap()
    })
    .await;

    let client = Client::new();
    let response = client
        .fetch(Request::get(server.url("/")).cookie("k", "v"))
        .await?;
    assert_eq!(response.headers()["echo-cookie"], "k=v");
    Ok(())
}

#[tokio::test]
async fn gzip_responses_decode_on_collect() -> Result<(), BoxError> {
    let server = start_server(|_| async {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"compressed payload").unwrap();
        let encoded = encoder.finish().unwrap();
        http::Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_ENCODING, "gzip")
            .body(Full::new(Bytes::from(encoded)))
            .unwrap()
    })
    .await;

    let client = Client::new();
    let response = client.fetch(Request::get(server.url("/"))).await?;
    assert_eq!(response.text().await?, "compressed payload");
    Ok(())
}

#[tokio::test]
async fn post_bodies_arrive_intact() -> Result<(), BoxError> {
    let server = start_server(|req| async move {
        let body = http_body_util::BodyExt::collect(req.into_body())
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();
        http::Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(body))
            .unwrap()
    })
    .await;

    let client = Client::new();
    let response = client
        .fetch(Request::post(server.url("/"), "ping"))
        .await?;
    assert_eq!(response.text().await?, "ping");
    Ok(())
}

#[tokio::test]
async fn disconnect_all_forces_a_fresh_connection() -> Result<(), BoxError> {
    let server = start_server(|_| async { ok_with("ok") }).await;
    let client = Client::new();

    client.fetch(Request::get(server.url("/"))).await?.text().await?;
    assert_eq!(server.connections(), 1);

    client.disconnect_all();

    client.fetch(Request::get(server.url("/"))).await?.text().await?;
    assert_eq!(server.connections(), 2);
    Ok(())
}

#[tokio::test]
async fn keep_alive_disabled_closes_after_each_request() -> Result<(), BoxError> {
    let server = start_server(|_| async { ok_with("ok") }).await;

    let config = Config::builder()
        .http1(Http1Config {
            keep_alive: false,
            ..Http1Config::default()
        })
        .build();
    let client = Client::with_config(config);

    for _ in 0..2 {
        client.fetch(Request::get(server.url("/"))).await?.text().await?;
    }
    // Released sockets are closed instead of parked, so each fetch dials.
    assert_eq!(server.connections(), 2);
    Ok(())
}

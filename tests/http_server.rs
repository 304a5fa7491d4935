//! End-to-end exercises of the HTTP/1.1 server connection: pipelining,
//! keep-alive, Expect/100 handling and protocol-error responses, driven
//! over a socketpair with raw wire bytes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use trellis_proxy::http1::server::{serve_connection, ServerTimeouts};
use trellis_proxy::http1::{HttpResponse, IncomingRequest};
use trellis_proxy::socket::FilteredSocket;

fn peer() -> std::net::SocketAddr {
    "127.0.0.1:9999".parse().unwrap()
}

fn text_response(body: String) -> HttpResponse {
    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain"),
    );
    HttpResponse::new(
        http::StatusCode::OK,
        headers,
        Some(trellis_proxy::istream::from_bytes(body)),
    )
}

async fn echo_path_handler(request: IncomingRequest) -> HttpResponse {
    text_response(format!("uri={}\n", request.uri))
}

/// Two pipelined requests on one connection are answered in order and
/// the connection stays open.
#[tokio::test]
async fn keep_alive_pipeline() {
    let (client, server) = UnixStream::pair().unwrap();
    let server_task = tokio::spawn(serve_connection(
        FilteredSocket::new_unix(server),
        peer(),
        false,
        Arc::new(echo_path_handler),
        ServerTimeouts::default(),
    ));

    let mut client = client;
    client
        .write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while !(count_occurrences(&received, b"uri=/a") == 1
        && count_occurrences(&received, b"uri=/b") == 1)
    {
        let n = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.read(&mut buf),
        )
        .await
        .expect("responses arrive in time")
        .unwrap();
        assert_ne!(n, 0, "connection closed early: {:?}", String::from_utf8_lossy(&received));
        received.extend_from_slice(&buf[..n]);
    }

    let text = String::from_utf8_lossy(&received);
    assert_eq!(text.matches("HTTP/1.1 200").count(), 2, "{}", text);
    let a = text.find("uri=/a").unwrap();
    let b = text.find("uri=/b").unwrap();
    assert!(a < b, "responses must arrive in request order");

    // connection is still open: a third request succeeds
    client
        .write_all(b"GET /c HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();
    let n = client.read(&mut buf).await.unwrap();
    assert!(n > 0);
    assert!(String::from_utf8_lossy(&buf[..n]).contains("uri=/c"));

    drop(client);
    server_task.await.unwrap();
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    if haystack.len() < needle.len() {
        return 0;
    }
    (0..=haystack.len() - needle.len())
        .filter(|&i| &haystack[i..i + needle.len()] == needle)
        .count()
}

/// `Expect: 100-continue` with a handler that never reads the body: no
/// interim 100 appears on the wire, the final response arrives, and the
/// connection closes.
#[tokio::test]
async fn expect_100_discarded_body() {
    let (client, server) = UnixStream::pair().unwrap();
    let server_task = tokio::spawn(serve_connection(
        FilteredSocket::new_unix(server),
        peer(),
        false,
        Arc::new(|_request: IncomingRequest| async {
            // respond without touching the body
            HttpResponse::message(http::StatusCode::OK, "foo")
        }),
        ServerTimeouts::default(),
    ));

    let mut client = client;
    client
        .write_all(
            b"POST /ignore HTTP/1.1\r\nHost: h\r\nExpect: 100-continue\r\nContent-Length: 1048576\r\n\r\n",
        )
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.read(&mut buf),
        )
        .await
        .expect("server answers without the body")
        .unwrap();
        if n == 0 {
            break; // server closed, as required
        }
        received.extend_from_slice(&buf[..n]);
    }

    let text = String::from_utf8_lossy(&received);
    assert!(!text.contains("100 Continue"), "no interim response: {}", text);
    assert_eq!(text.matches("HTTP/1.1 200").count(), 1, "{}", text);
    assert!(text.contains("foo"));
    assert!(text.contains("connection: close") || text.contains("Connection: close"));

    server_task.await.unwrap();
}

/// When the handler does read the body, the server sends the interim
/// 100 first and keep-alive survives.
#[tokio::test]
async fn expect_100_consumed_body() {
    let (client, server) = UnixStream::pair().unwrap();
    tokio::spawn(serve_connection(
        FilteredSocket::new_unix(server),
        peer(),
        false,
        Arc::new(|mut request: IncomingRequest| async move {
            let body = request.body.take().unwrap();
            let data = trellis_proxy::istream::collect(body).await.unwrap();
            text_response(format!("len={}\n", data.len()))
        }),
        ServerTimeouts::default(),
    ));

    let mut client = client;
    client
        .write_all(b"POST / HTTP/1.1\r\nHost: h\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n")
        .await
        .unwrap();

    // wait for the interim response before sending the body
    let mut buf = [0u8; 4096];
    let n = client.read(&mut buf).await.unwrap();
    let interim = String::from_utf8_lossy(&buf[..n]);
    assert!(interim.contains("100 Continue"), "{}", interim);

    client.write_all(b"wxyz").await.unwrap();
    let mut received = Vec::new();
    while !received.windows(5).any(|w| w == b"len=4") {
        let n = client.read(&mut buf).await.unwrap();
        assert_ne!(n, 0);
        received.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.contains("HTTP/1.1 200"), "{}", text);
}

/// An unsupported Expect value draws 417.
#[tokio::test]
async fn unknown_expectation_is_417() {
    let (client, server) = UnixStream::pair().unwrap();
    tokio::spawn(serve_connection(
        FilteredSocket::new_unix(server),
        peer(),
        false,
        Arc::new(echo_path_handler),
        ServerTimeouts::default(),
    ));

    let mut client = client;
    client
        .write_all(b"POST / HTTP/1.1\r\nHost: h\r\nExpect: teleport\r\nContent-Length: 1\r\n\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 4096];
    let n = client.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).contains("417"));
}

/// Garbage on the wire draws a 400 and the connection closes.
#[tokio::test]
async fn malformed_request_is_400() {
    let (client, server) = UnixStream::pair().unwrap();
    let handled = Arc::new(AtomicUsize::new(0));
    let handled2 = handled.clone();
    tokio::spawn(serve_connection(
        FilteredSocket::new_unix(server),
        peer(),
        false,
        Arc::new(move |request: IncomingRequest| {
            handled2.fetch_add(1, Ordering::SeqCst);
            async move { echo_path_handler(request).await }
        }),
        ServerTimeouts::default(),
    ));

    let mut client = client;
    client.write_all(b"\x01\x02\x03\r\n\r\n").await.unwrap();
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = client.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    assert!(String::from_utf8_lossy(&received).contains("400"));
    assert_eq!(handled.load(Ordering::SeqCst), 0, "handler never sees garbage");
}

/// Zero-length bodies: the response announces `Content-Length: 0` and
/// a request with `Content-Length: 0` parses as bodyless.
#[tokio::test]
async fn zero_length_bodies() {
    let (client, server) = UnixStream::pair().unwrap();
    tokio::spawn(serve_connection(
        FilteredSocket::new_unix(server),
        peer(),
        false,
        Arc::new(|request: IncomingRequest| async move {
            assert!(request.body.is_none());
            HttpResponse::new(http::StatusCode::OK, http::HeaderMap::new(), None)
        }),
        ServerTimeouts::default(),
    ));

    let mut client = client;
    client
        .write_all(b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 4096];
    let n = client.read(&mut buf).await.unwrap();
    let text = String::from_utf8_lossy(&buf[..n]);
    assert!(text.contains("HTTP/1.1 200"), "{}", text);
    assert!(
        text.contains("content-length: 0") || text.contains("Content-Length: 0"),
        "{}",
        text
    );
}

/// Chunked request bodies are decoded transparently.
#[tokio::test]
async fn chunked_request_body() {
    let (client, server) = UnixStream::pair().unwrap();
    tokio::spawn(serve_connection(
        FilteredSocket::new_unix(server),
        peer(),
        false,
        Arc::new(|mut request: IncomingRequest| async move {
            let body = request.body.take().unwrap();
            let data = trellis_proxy::istream::collect(body).await.unwrap();
            text_response(format!("got={}\n", String::from_utf8_lossy(&data)))
        }),
        ServerTimeouts::default(),
    ));

    let mut client = client;
    client
        .write_all(
            b"POST / HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n",
        )
        .await
        .unwrap();
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while !received.windows(10).any(|w| w == b"got=abcdef") {
        let n = client.read(&mut buf).await.unwrap();
        assert_ne!(n, 0, "{:?}", String::from_utf8_lossy(&received));
        received.extend_from_slice(&buf[..n]);
    }
}

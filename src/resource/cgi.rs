use super::address::CgiAddress;
use crate::error::ProxyError;
use crate::http1::HttpResponse;
use crate::istream::{BoxIstream, CatIstream, ReaderIstream};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Run a pipe filter: the request body goes into the child's stdin, its
/// stdout becomes the response body.
pub async fn run_pipe(
    address: &CgiAddress,
    body: Option<BoxIstream>,
) -> Result<HttpResponse, ProxyError> {
    let mut child = Command::new(&address.path)
        .args(&address.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            warn!("pipe: failed to spawn {}: {}", address.path, e);
            ProxyError::Io(e)
        })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take().expect("stdout was piped");

    if let Some(body) = body {
        tokio::spawn(copy_body_to_child(body, stdin));
    } else {
        drop(stdin);
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    // keep the child handle alive as long as the body stream
    let body = ReaderIstream::new(ChildStdoutGuard {
        stdout,
        _child: child,
    });
    Ok(HttpResponse::new(
        StatusCode::OK,
        headers,
        Some(Box::new(body)),
    ))
}

/// Run a CGI responder: spawn, pass the request as environment, feed the
/// body, parse the CGI response head from stdout.
pub async fn run_cgi(
    address: &CgiAddress,
    method: &Method,
    request_headers: &HeaderMap,
    body: Option<BoxIstream>,
) -> Result<HttpResponse, ProxyError> {
    let executable = address
        .interpreter
        .as_deref()
        .unwrap_or(address.path.as_str());
    let mut cmd = Command::new(executable);
    if address.interpreter.is_some() {
        cmd.arg(&address.path);
    }
    cmd.args(&address.args);
    cmd.env_clear();
    cmd.env("GATEWAY_INTERFACE", "CGI/1.1");
    cmd.env("SERVER_PROTOCOL", "HTTP/1.1");
    cmd.env("REQUEST_METHOD", method.as_str());
    cmd.env(
        "SCRIPT_NAME",
        address.script_name.as_deref().unwrap_or(""),
    );
    cmd.env("SCRIPT_FILENAME", &address.path);
    if let Some(pi) = &address.path_info {
        cmd.env("PATH_INFO", pi);
    }
    if let Some(qs) = &address.query_string {
        cmd.env("QUERY_STRING", qs);
    }
    if let Some(root) = &address.document_root {
        cmd.env("DOCUMENT_ROOT", root);
    }
    if let Some(action) = &address.action {
        cmd.env("REDIRECT_STATUS", "200");
        cmd.env("SCRIPT_FILENAME", action);
    }
    if let Some(ct) = request_headers.get(http::header::CONTENT_TYPE) {
        if let Ok(v) = ct.to_str() {
            cmd.env("CONTENT_TYPE", v);
        }
    }
    if let Some(cl) = request_headers.get(http::header::CONTENT_LENGTH) {
        if let Ok(v) = cl.to_str() {
            cmd.env("CONTENT_LENGTH", v);
        }
    }
    for (name, value) in request_headers {
        if name == http::header::CONTENT_TYPE || name == http::header::CONTENT_LENGTH {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        let env_name = format!(
            "HTTP_{}",
            name.as_str().to_ascii_uppercase().replace('-', "_")
        );
        cmd.env(env_name, value);
    }

    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            warn!("cgi: failed to spawn {}: {}", address.path, e);
            ProxyError::Io(e)
        })?;

    let stdin = child.stdin.take();
    let mut stdout = child.stdout.take().expect("stdout was piped");

    if let Some(body) = body {
        tokio::spawn(copy_body_to_child(body, stdin));
    } else {
        drop(stdin);
    }

    // read the CGI response head
    let mut head = BytesMut::with_capacity(4096);
    let head_end = loop {
        let n = stdout.read_buf(&mut head).await.map_err(ProxyError::Io)?;
        if let Some(end) = find_head_end(&head) {
            break end;
        }
        if n == 0 {
            return Err(ProxyError::Protocol(
                "CGI child closed before response head".into(),
            ));
        }
        if head.len() > 64 * 1024 {
            return Err(ProxyError::Protocol("CGI response head too large".into()));
        }
    };

    let head_bytes = head.split_to(head_end).freeze();
    let leftover = head.freeze();
    let (status, headers) = parse_cgi_head(&head_bytes)?;

    let body: BoxIstream = Box::new(CatIstream::new([
        crate::istream::from_bytes(leftover),
        Box::new(ReaderIstream::new(ChildStdoutGuard {
            stdout,
            _child: child,
        })) as BoxIstream,
    ]));

    Ok(HttpResponse::new(status, headers, Some(body)))
}

struct ChildStdoutGuard {
    stdout: tokio::process::ChildStdout,
    _child: tokio::process::Child,
}

impl tokio::io::AsyncRead for ChildStdoutGuard {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

async fn copy_body_to_child(mut body: BoxIstream, stdin: Option<tokio::process::ChildStdin>) {
    let Some(mut stdin) = stdin else { return };
    loop {
        match crate::istream::next_chunk(body.as_mut()).await {
            Some(Ok(chunk)) => {
                if stdin.write_all(&chunk).await.is_err() {
                    // child stopped reading; not an error for us
                    return;
                }
            }
            Some(Err(e)) => {
                debug!("cgi: request body failed: {}", e);
                return;
            }
            None => {
                let _ = stdin.shutdown().await;
                return;
            }
        }
    }
}

/// Find the end of the header block: CRLFCRLF or LFLF.
pub(super) fn find_head_end(data: &[u8]) -> Option<usize> {
    if let Some(pos) = memchr::memmem::find(data, b"\r\n\r\n") {
        return Some(pos + 4);
    }
    memchr::memmem::find(data, b"\n\n").map(|pos| pos + 2)
}

/// Parse a CGI header block: `Status:` selects the response status,
/// everything else is a response header.
pub(super) fn parse_cgi_head(data: &Bytes) -> Result<(StatusCode, HeaderMap), ProxyError> {
    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();
    for line in data.split(|&b| b == b'\n') {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        if line.is_empty() {
            continue;
        }
        let Some(colon) = memchr::memchr(b':', line) else {
            return Err(ProxyError::Protocol("malformed CGI header line".into()));
        };
        let name = &line[..colon];
        let value = line[colon + 1..]
            .strip_prefix(b" ")
            .unwrap_or(&line[colon + 1..]);
        if name.eq_ignore_ascii_case(b"status") {
            let code = value
                .get(..3)
                .and_then(|c| std::str::from_utf8(c).ok())
                .and_then(|c| c.parse::<u16>().ok())
                .and_then(|c| StatusCode::from_u16(c).ok())
                .ok_or_else(|| ProxyError::Protocol("bad CGI Status header".into()))?;
            status = code;
            continue;
        }
        let name = HeaderName::from_bytes(name)
            .map_err(|_| ProxyError::Protocol("bad CGI header name".into()))?;
        let value = HeaderValue::from_bytes(value)
            .map_err(|_| ProxyError::Protocol("bad CGI header value".into()))?;
        headers.append(name, value);
    }
    Ok((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cgi_head_with_status() {
        let head = Bytes::from("Status: 404 Not Found\r\nContent-Type: text/html\r\n\r\n");
        let (status, headers) = parse_cgi_head(&head).unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(headers.get(http::header::CONTENT_TYPE).unwrap(), "text/html");
    }

    #[test]
    fn default_status_is_200() {
        let head = Bytes::from("Content-Type: text/plain\n\n");
        let (status, _) = parse_cgi_head(&head).unwrap();
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn pipe_filter_round_trip() {
        let address = CgiAddress {
            path: "/bin/cat".into(),
            ..Default::default()
        };
        let response = run_pipe(&address, Some(crate::istream::from_bytes("filter me")))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        let body = crate::istream::collect(response.body.unwrap()).await.unwrap();
        assert_eq!(body, Bytes::from("filter me"));
    }

    #[tokio::test]
    async fn cgi_child_response() {
        let address = CgiAddress {
            path: "/bin/sh".into(),
            args: vec![
                "-c".into(),
                "printf 'Status: 201 Created\\r\\nContent-Type: text/plain\\r\\n\\r\\nhello from cgi'"
                    .into(),
            ],
            ..Default::default()
        };
        let response = run_cgi(&address, &Method::GET, &HeaderMap::new(), None)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        let body = crate::istream::collect(response.body.unwrap()).await.unwrap();
        assert_eq!(body, Bytes::from("hello from cgi"));
    }
}

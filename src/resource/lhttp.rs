use super::address::LhttpAddress;
use super::child::{ChildSpec, ChildStock};
use crate::error::ProxyError;
use crate::http1::client::{send_request, ClientConnection, ClientRequest};
use crate::http1::HttpResponse;
use crate::istream::BoxIstream;
use crate::socket::FilteredSocket;
use http::{HeaderMap, HeaderValue, Method};

/// Dispatch a request to a local HTTP child: a spawned process speaking
/// plain HTTP/1.1 on a private unix socket.
pub async fn send_lhttp_request(
    stock: &ChildStock,
    address: &LhttpAddress,
    method: Method,
    mut headers: HeaderMap,
    body: Option<BoxIstream>,
) -> Result<HttpResponse, ProxyError> {
    let spec = ChildSpec {
        executable: address.path.clone(),
        args: address.args.clone(),
        concurrency: address.concurrency.max(1),
    };
    let key = format!("lhttp:{}", address.path);
    let guard = stock.get(&key, &spec).await?;
    let stream = guard.connect().await?;

    if let Some(host) = &address.host_and_port {
        if let Ok(v) = HeaderValue::from_str(host) {
            headers.insert(http::header::HOST, v);
        }
    }

    let conn = ClientConnection::new(FilteredSocket::new_unix(stream));
    let request = ClientRequest {
        method,
        uri: address.uri.clone(),
        headers,
        body,
    };
    // connections to children are one-shot; the concurrency guard is
    // released once the response body is done
    let response = send_request(
        conn,
        request,
        Box::new(move |_conn, _reuse| {
            drop(guard);
        }),
    )
    .await?;
    Ok(response)
}

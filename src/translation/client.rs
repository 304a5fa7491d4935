use super::protocol::{self, Packet, TranslationCommand, PROTOCOL_VERSION};
use super::{HeaderForwardMode, HeaderForwardSettings, TranslateRequest, TranslateResponse, View};
use crate::error::ProxyError;
use crate::resource::{
    CgiAddress, FileAddress, HttpAddress, LhttpAddress, NfsAddress, ResourceAddress,
};
use crate::stock::{Stock, StockClass, StockError};
use bytes::BytesMut;
use http::StatusCode;
use std::future::Future;
use std::os::unix::io::AsRawFd;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(60);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

struct TranslationConnClass;

impl StockClass for TranslationConnClass {
    type Item = UnixStream;

    fn create(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<UnixStream, StockError>> + Send + '_>> {
        let path = key.to_string();
        Box::pin(async move { UnixStream::connect(&path).await.map_err(StockError::Create) })
    }

    fn validate(&self, stream: &mut UnixStream) -> bool {
        // an idle translation connection that has pending bytes (or was
        // closed) is broken and gets retired
        let mut probe = [0u8; 1];
        let n = unsafe {
            libc::recv(
                stream.as_raw_fd(),
                probe.as_mut_ptr() as *mut libc::c_void,
                1,
                libc::MSG_DONTWAIT | libc::MSG_PEEK,
            )
        };
        if n == 0 {
            debug!("translation: idle connection closed by server");
            return false;
        }
        if n > 0 {
            warn!("translation: unexpected data on idle connection");
            return false;
        }
        let errno = std::io::Error::last_os_error();
        errno.kind() == std::io::ErrorKind::WouldBlock
    }
}

/// Pool of connected translation-server sockets.
pub struct TranslationStock {
    stock: Stock<TranslationConnClass>,
    socket_path: String,
}

impl TranslationStock {
    pub fn new(socket_path: String, limit: usize) -> Self {
        Self {
            stock: Stock::new(TranslationConnClass, limit, limit)
                .with_idle_timeout(Duration::from_secs(300)),
            socket_path,
        }
    }

    /// One translation round trip. Translation requests are never
    /// retried; any failure surfaces to the caller.
    pub async fn translate(
        &self,
        request: &TranslateRequest,
    ) -> Result<TranslateResponse, ProxyError> {
        let mut lease = self
            .stock
            .get(&self.socket_path)
            .await
            .map_err(|e| ProxyError::Translation(e.to_string()))?;

        let payload = marshal_request(request);
        let result = run_round_trip(lease.get_mut(), payload).await;
        match result {
            Ok(response) => {
                lease.release(true, 1);
                Ok(response)
            }
            Err(e) => {
                // dropping the lease discards the connection
                Err(e)
            }
        }
    }
}

fn marshal_request(request: &TranslateRequest) -> BytesMut {
    let mut out = BytesMut::with_capacity(256);
    protocol::write_packet(&mut out, TranslationCommand::Begin, &[PROTOCOL_VERSION]);
    protocol::write_string(&mut out, TranslationCommand::Uri, &request.uri);
    if let Some(host) = &request.host {
        protocol::write_string(&mut out, TranslationCommand::Host, host);
    }
    if let Some(session) = &request.session {
        protocol::write_string(&mut out, TranslationCommand::Session, session);
    }
    if let Some(realm) = &request.realm {
        protocol::write_string(&mut out, TranslationCommand::Realm, realm);
    }
    if let Some(check) = &request.check {
        protocol::write_packet(&mut out, TranslationCommand::Check, check);
    }
    if let Some(auth) = &request.auth {
        protocol::write_packet(&mut out, TranslationCommand::Auth, auth);
    }
    if let Some(wfu) = &request.want_full_uri {
        protocol::write_string(&mut out, TranslationCommand::WantFullUri, wfu);
    }
    if let Some(widget_type) = &request.widget_type {
        protocol::write_string(&mut out, TranslationCommand::WidgetType, widget_type);
    }
    if let Some(param) = &request.param {
        protocol::write_string(&mut out, TranslationCommand::Param, param);
    }
    protocol::write_packet(&mut out, TranslationCommand::End, b"");
    out
}

async fn run_round_trip(
    stream: &mut UnixStream,
    payload: BytesMut,
) -> Result<TranslateResponse, ProxyError> {
    tokio::time::timeout(WRITE_TIMEOUT, stream.write_all(&payload))
        .await
        .map_err(|_| ProxyError::Translation("write timeout".into()))?
        .map_err(|e| ProxyError::Translation(e.to_string()))?;

    let mut parser = ResponseParser::default();
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        while let Some(packet) =
            protocol::read_packet(&mut buf).map_err(|e| ProxyError::Translation(e.into()))?
        {
            if parser.feed(packet)? {
                return parser.finish();
            }
        }
        let n = tokio::time::timeout(READ_TIMEOUT, stream.read_buf(&mut buf))
            .await
            .map_err(|_| ProxyError::Translation("translation server timed out".into()))?
            .map_err(|e| ProxyError::Translation(e.to_string()))?;
        if n == 0 {
            return Err(ProxyError::Translation(
                "translation server closed the connection".into(),
            ));
        }
    }
}

/// Accumulates response packets into a `TranslateResponse`. Address
/// packets build up the current `ResourceAddress`; `View` opens a new
/// view whose subsequent packets refine it.
#[derive(Default)]
struct ResponseParser {
    response: TranslateResponse,
    /// a View packet was seen; address packets now target the last view
    in_view: bool,
    seen_begin: bool,
}

fn utf8(packet: &Packet) -> Result<String, ProxyError> {
    std::str::from_utf8(&packet.payload)
        .map(str::to_string)
        .map_err(|_| ProxyError::Translation("non-UTF-8 payload".into()))
}

impl ResponseParser {
    /// Returns `true` when the final packet (End) was consumed.
    fn feed(&mut self, packet: Packet) -> Result<bool, ProxyError> {
        use TranslationCommand::*;
        let r = &mut self.response;
        match packet.command {
            Begin => {
                if packet.payload.first() != Some(&PROTOCOL_VERSION) {
                    return Err(ProxyError::Translation("protocol version mismatch".into()));
                }
                self.seen_begin = true;
                return Ok(false);
            }
            End => {
                if !self.seen_begin {
                    return Err(ProxyError::Translation("End before Begin".into()));
                }
                return Ok(true);
            }
            _ => {}
        }
        if !self.seen_begin {
            return Err(ProxyError::Translation("packet before Begin".into()));
        }

        let address = if self.in_view {
            &mut r.views.last_mut().unwrap().address
        } else {
            &mut r.address
        };

        match packet.command {
            Status => {
                let code = match packet.payload.len() {
                    2 => u16::from_le_bytes([packet.payload[0], packet.payload[1]]),
                    _ => return Err(ProxyError::Translation("bad Status payload".into())),
                };
                r.status = StatusCode::from_u16(code).ok();
            }
            Path => {
                *address = ResourceAddress::Local(FileAddress {
                    path: utf8(&packet)?,
                    ..Default::default()
                });
            }
            Http => {
                *address = ResourceAddress::Http(parse_http_address(&utf8(&packet)?)?);
            }
            Address => {
                let addr: std::net::SocketAddr = utf8(&packet)?
                    .parse()
                    .map_err(|_| ProxyError::Translation("bad Address payload".into()))?;
                match address {
                    ResourceAddress::Http(a) => a.addresses.push(addr),
                    ResourceAddress::FastCgi(a) | ResourceAddress::Was(a) => {
                        a.address_list.push(addr)
                    }
                    _ => {
                        return Err(ProxyError::Translation(
                            "Address without clustered address".into(),
                        ))
                    }
                }
            }
            Lhttp => {
                *address = ResourceAddress::Lhttp(LhttpAddress {
                    path: utf8(&packet)?,
                    concurrency: 1,
                    uri: "/".into(),
                    ..Default::default()
                });
            }
            Cgi | FastCgi | Was | Pipe => {
                let cgi = CgiAddress {
                    path: utf8(&packet)?,
                    ..Default::default()
                };
                *address = match packet.command {
                    Cgi => ResourceAddress::Cgi(cgi),
                    FastCgi => ResourceAddress::FastCgi(cgi),
                    Was => ResourceAddress::Was(cgi),
                    _ => ResourceAddress::Pipe(cgi),
                };
            }
            NfsServer => {
                *address = ResourceAddress::Nfs(NfsAddress {
                    server: utf8(&packet)?,
                    ..Default::default()
                });
            }
            NfsExport => match address {
                ResourceAddress::Nfs(a) => a.export = utf8(&packet)?,
                _ => return Err(ProxyError::Translation("NfsExport without NfsServer".into())),
            },
            NfsPath => match address {
                ResourceAddress::Nfs(a) => a.path = utf8(&packet)?,
                _ => return Err(ProxyError::Translation("NfsPath without NfsServer".into())),
            },
            Append => {
                let arg = utf8(&packet)?;
                match address {
                    ResourceAddress::Cgi(a)
                    | ResourceAddress::FastCgi(a)
                    | ResourceAddress::Was(a)
                    | ResourceAddress::Pipe(a) => a.args.push(arg),
                    ResourceAddress::Lhttp(a) => a.args.push(arg),
                    _ => return Err(ProxyError::Translation("Append without program".into())),
                }
            }
            PathInfo => {
                let value = utf8(&packet)?;
                match address {
                    ResourceAddress::Cgi(a)
                    | ResourceAddress::FastCgi(a)
                    | ResourceAddress::Was(a)
                    | ResourceAddress::Pipe(a) => a.path_info = Some(value),
                    ResourceAddress::Lhttp(a) => a.uri = value,
                    _ => return Err(ProxyError::Translation("PathInfo without program".into())),
                }
            }
            QueryString => {
                let value = utf8(&packet)?;
                match address {
                    ResourceAddress::Cgi(a)
                    | ResourceAddress::FastCgi(a)
                    | ResourceAddress::Was(a)
                    | ResourceAddress::Pipe(a) => a.query_string = Some(value),
                    _ => {
                        return Err(ProxyError::Translation(
                            "QueryString without program".into(),
                        ))
                    }
                }
            }
            ScriptName => match address {
                ResourceAddress::Cgi(a)
                | ResourceAddress::FastCgi(a)
                | ResourceAddress::Was(a)
                | ResourceAddress::Pipe(a) => a.script_name = Some(utf8(&packet)?),
                _ => return Err(ProxyError::Translation("ScriptName without program".into())),
            },
            DocumentRoot => match address {
                ResourceAddress::Cgi(a)
                | ResourceAddress::FastCgi(a)
                | ResourceAddress::Was(a)
                | ResourceAddress::Pipe(a) => a.document_root = Some(utf8(&packet)?),
                ResourceAddress::Local(a) => a.document_root = Some(utf8(&packet)?),
                _ => {
                    return Err(ProxyError::Translation(
                        "DocumentRoot without address".into(),
                    ))
                }
            },
            Action => match address {
                ResourceAddress::Cgi(a) | ResourceAddress::FastCgi(a) => {
                    a.action = Some(utf8(&packet)?)
                }
                _ => return Err(ProxyError::Translation("Action without CGI".into())),
            },
            Interpreter => match address {
                ResourceAddress::Cgi(a) | ResourceAddress::FastCgi(a) => {
                    a.interpreter = Some(utf8(&packet)?)
                }
                _ => return Err(ProxyError::Translation("Interpreter without CGI".into())),
            },
            Concurrency => match address {
                ResourceAddress::Lhttp(a) => {
                    if packet.payload.len() != 2 {
                        return Err(ProxyError::Translation("bad Concurrency payload".into()));
                    }
                    a.concurrency = u16::from_le_bytes([packet.payload[0], packet.payload[1]]);
                }
                _ => return Err(ProxyError::Translation("Concurrency without Lhttp".into())),
            },

            Base => r.base = Some(utf8(&packet)?),
            EasyBase => r.easy_base = true,
            Regex => r.regex = Some(utf8(&packet)?),
            InverseRegex => r.inverse_regex = Some(utf8(&packet)?),
            UnsafeBase => r.unsafe_base = true,
            ExpandPath => r.expand_path = Some(utf8(&packet)?),
            MaxAge => {
                if packet.payload.len() != 4 {
                    return Err(ProxyError::Translation("bad MaxAge payload".into()));
                }
                let secs = u32::from_le_bytes([
                    packet.payload[0],
                    packet.payload[1],
                    packet.payload[2],
                    packet.payload[3],
                ]);
                r.max_age = Some(Duration::from_secs(secs as u64));
            }
            Vary => {
                for pair in packet.payload.chunks_exact(2) {
                    if let Some(cmd) =
                        TranslationCommand::from_u16(u16::from_le_bytes([pair[0], pair[1]]))
                    {
                        r.vary.push(cmd);
                    }
                }
            }
            Invalidate => {
                for pair in packet.payload.chunks_exact(2) {
                    if let Some(cmd) =
                        TranslationCommand::from_u16(u16::from_le_bytes([pair[0], pair[1]]))
                    {
                        r.invalidate.push(cmd);
                    }
                }
            }
            CacheTag => r.cache_tag = Some(utf8(&packet)?),
            AutoFlushCache => r.auto_flush_cache = true,

            Redirect => r.redirect = Some(utf8(&packet)?),
            TestPath => r.test_path = Some(utf8(&packet)?),
            Process => r.process = true,
            Container => r.container = true,
            ProcessCss => r.process_css = true,
            ProcessText => r.process_text = true,
            PrefixCssClass => r.prefix_css_class = true,
            PrefixXmlId => r.prefix_xml_id = true,
            FocusWidget => r.focus_widget = true,
            Stateful => r.stateful = true,

            View => {
                let name = utf8(&packet)?;
                r.views.push(super::View {
                    name: (!name.is_empty()).then_some(name),
                    ..Default::default()
                });
                self.in_view = true;
            }
            RequestHeaderForward | ResponseHeaderForward => {
                let settings = parse_header_forward(&packet.payload)?;
                let view = if self.in_view {
                    r.views.last_mut().unwrap()
                } else {
                    // header policy outside a view applies to an
                    // implicit default view
                    if r.views.is_empty() {
                        r.views.push(super::View::default());
                    }
                    r.views.first_mut().unwrap()
                };
                if packet.command == RequestHeaderForward {
                    view.request_header_forward = settings;
                } else {
                    view.response_header_forward = settings;
                }
            }

            Begin | End | Uri | Host | Session | Realm | Check | Auth | WantFullUri
            | WidgetType | Param => {
                return Err(ProxyError::Translation(format!(
                    "unexpected {:?} in response",
                    packet.command
                )));
            }
        }
        Ok(false)
    }

    fn finish(self) -> Result<TranslateResponse, ProxyError> {
        Ok(self.response)
    }
}

/// Payload: 4 bytes, one `HeaderForwardMode` per group
/// (identity, capabilities, cookie, other).
fn parse_header_forward(payload: &[u8]) -> Result<HeaderForwardSettings, ProxyError> {
    if payload.len() != 4 {
        return Err(ProxyError::Translation(
            "bad header-forward payload".into(),
        ));
    }
    fn mode(v: u8) -> Result<HeaderForwardMode, ProxyError> {
        Ok(match v {
            0 => HeaderForwardMode::No,
            1 => HeaderForwardMode::Yes,
            2 => HeaderForwardMode::Mangle,
            _ => return Err(ProxyError::Translation("bad header-forward mode".into())),
        })
    }
    Ok(HeaderForwardSettings {
        identity: mode(payload[0])?,
        capabilities: mode(payload[1])?,
        cookie: mode(payload[2])?,
        other: mode(payload[3])?,
    })
}

/// "http://host[:port]/path" or "https://…". Addresses follow in
/// separate `Address` packets.
fn parse_http_address(value: &str) -> Result<HttpAddress, ProxyError> {
    let (https, rest) = if let Some(rest) = value.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = value.strip_prefix("http://") {
        (false, rest)
    } else {
        return Err(ProxyError::Translation("bad Http payload".into()));
    };
    let (host_and_port, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if host_and_port.is_empty() {
        return Err(ProxyError::Translation("empty host in Http payload".into()));
    }
    Ok(HttpAddress {
        https,
        host_and_port: host_and_port.to_string(),
        path: path.to_string(),
        addresses: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_packets(buf: &mut BytesMut) -> TranslateResponse {
        let mut parser = ResponseParser::default();
        while let Some(packet) = protocol::read_packet(buf).unwrap() {
            if parser.feed(packet).unwrap() {
                return parser.finish().unwrap();
            }
        }
        panic!("response not terminated");
    }

    #[test]
    fn parses_http_response_with_addresses() {
        let mut buf = BytesMut::new();
        protocol::write_packet(&mut buf, TranslationCommand::Begin, &[PROTOCOL_VERSION]);
        protocol::write_string(&mut buf, TranslationCommand::Http, "http://backend:8080/app/");
        protocol::write_string(&mut buf, TranslationCommand::Address, "10.1.0.1:8080");
        protocol::write_string(&mut buf, TranslationCommand::Address, "10.1.0.2:8080");
        protocol::write_string(&mut buf, TranslationCommand::Base, "/app/");
        protocol::write_packet(&mut buf, TranslationCommand::EasyBase, b"");
        protocol::write_packet(&mut buf, TranslationCommand::End, b"");

        let r = parse_packets(&mut buf);
        match &r.address {
            ResourceAddress::Http(a) => {
                assert!(!a.https);
                assert_eq!(a.host_and_port, "backend:8080");
                assert_eq!(a.path, "/app/");
                assert_eq!(a.addresses.len(), 2);
            }
            other => panic!("wrong address {:?}", other),
        }
        assert_eq!(r.base.as_deref(), Some("/app/"));
        assert!(r.easy_base);
    }

    #[test]
    fn parses_views() {
        let mut buf = BytesMut::new();
        protocol::write_packet(&mut buf, TranslationCommand::Begin, &[PROTOCOL_VERSION]);
        protocol::write_packet(&mut buf, TranslationCommand::Process, b"");
        protocol::write_packet(&mut buf, TranslationCommand::Container, b"");
        protocol::write_string(&mut buf, TranslationCommand::View, "raw");
        protocol::write_string(&mut buf, TranslationCommand::Http, "http://w:80/widget");
        protocol::write_packet(&mut buf, TranslationCommand::End, b"");

        let r = parse_packets(&mut buf);
        assert!(r.process && r.container);
        assert_eq!(r.views.len(), 1);
        assert_eq!(r.views[0].name.as_deref(), Some("raw"));
        assert!(matches!(r.views[0].address, ResourceAddress::Http(_)));
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut parser = ResponseParser::default();
        let mut buf = BytesMut::new();
        protocol::write_packet(&mut buf, TranslationCommand::Begin, &[99]);
        let packet = protocol::read_packet(&mut buf).unwrap().unwrap();
        assert!(parser.feed(packet).is_err());
    }

    #[test]
    fn vary_list_parses() {
        let mut buf = BytesMut::new();
        protocol::write_packet(&mut buf, TranslationCommand::Begin, &[PROTOCOL_VERSION]);
        protocol::write_string(&mut buf, TranslationCommand::Path, "/srv/file");
        let vary: Vec<u8> = [TranslationCommand::Host as u16, TranslationCommand::Session as u16]
            .iter()
            .flat_map(|c| c.to_le_bytes())
            .collect();
        protocol::write_packet(&mut buf, TranslationCommand::Vary, &vary);
        protocol::write_packet(&mut buf, TranslationCommand::End, b"");

        let r = parse_packets(&mut buf);
        assert_eq!(
            r.vary,
            vec![TranslationCommand::Host, TranslationCommand::Session]
        );
    }
}

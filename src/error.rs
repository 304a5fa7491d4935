use http::StatusCode;
use std::fmt;

/// Widget failure taxonomy. Widget errors are swallowed at the widget
/// boundary and logged; they never abort the surrounding response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetErrorKind {
    Unspecified,
    /// the processor was pointed at a non-HTML resource
    WrongType,
    /// upstream sent a non-identity content encoding
    UnsupportedEncoding,
    NoSuchView,
    NotAContainer,
    Forbidden,
}

impl fmt::Display for WidgetErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WidgetErrorKind::Unspecified => write!(f, "widget error"),
            WidgetErrorKind::WrongType => write!(f, "widget response is not HTML"),
            WidgetErrorKind::UnsupportedEncoding => {
                write!(f, "widget response has unsupported encoding")
            }
            WidgetErrorKind::NoSuchView => write!(f, "no such view"),
            WidgetErrorKind::NotAContainer => write!(f, "widget is not a container"),
            WidgetErrorKind::Forbidden => write!(f, "widget access forbidden"),
        }
    }
}

#[derive(Debug)]
pub enum ProxyError {
    Io(std::io::Error),
    /// peer violated HTTP / FastCGI / WAS / translation framing
    Protocol(String),
    Timeout,
    /// peer closed mid-body
    Premature,
    Widget(WidgetErrorKind, String),
    /// no admissible cluster member
    ClusterEmpty,
    /// rubber full or item too large; the response is still forwarded
    CacheMemory,
    Translation(String),
    Config(String),
    Internal(String),
}

impl ProxyError {
    /// The status presented to the client when this error terminates a
    /// request.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::ClusterEmpty => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Config(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Io(e) => write!(f, "I/O error: {}", e),
            ProxyError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ProxyError::Timeout => write!(f, "upstream timeout"),
            ProxyError::Premature => write!(f, "peer closed prematurely"),
            ProxyError::Widget(kind, widget) => write!(f, "{} (widget '{}')", kind, widget),
            ProxyError::ClusterEmpty => write!(f, "cluster is empty"),
            ProxyError::CacheMemory => write!(f, "cache memory exhausted"),
            ProxyError::Translation(msg) => write!(f, "translation error: {}", msg),
            ProxyError::Config(msg) => write!(f, "config error: {}", msg),
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Io(e)
    }
}

impl From<crate::socket::SocketError> for ProxyError {
    fn from(e: crate::socket::SocketError) -> Self {
        match e {
            crate::socket::SocketError::Io(e) => ProxyError::Io(e),
            crate::socket::SocketError::ReadTimeout
            | crate::socket::SocketError::WriteTimeout => ProxyError::Timeout,
            crate::socket::SocketError::Filter(e) => ProxyError::Protocol(e.to_string()),
        }
    }
}

impl From<crate::http1::client::HttpClientError> for ProxyError {
    fn from(e: crate::http1::client::HttpClientError) -> Self {
        use crate::http1::client::HttpClientError;
        match e {
            HttpClientError::Io(e) => ProxyError::Io(e),
            HttpClientError::Garbage(m) | HttpClientError::Unspecified(m) => {
                ProxyError::Protocol(m.to_string())
            }
            HttpClientError::Premature { .. } => ProxyError::Premature,
            HttpClientError::Timeout => ProxyError::Timeout,
        }
    }
}

impl From<crate::stock::StockError> for ProxyError {
    fn from(e: crate::stock::StockError) -> Self {
        ProxyError::Internal(e.to_string())
    }
}

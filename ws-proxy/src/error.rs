//! Error types shared across the proxy

use std::fmt;
use std::io;

use tokio_tungstenite::tungstenite;

use crate::hello::HelloError;
use crate::registry::RejectReason;
use crate::session::CloseRequest;
use crate::tls::TlsError;

/// Errors that end a session (or, for `Io`/`Tls`, stop the listener)
#[derive(Debug)]
pub enum ProxyError {
    /// Socket-level failure
    Io(io::Error),
    /// TLS configuration or handshake failure
    Tls(TlsError),
    /// WebSocket protocol or transport failure
    WebSocket(tungstenite::Error),
    /// First frame was not a valid hello
    Hello(HelloError),
    /// The meetup refused another member
    Rejected(RejectReason),
    /// The client closed its side of the connection
    Disconnected,
    /// A close was requested for this session (keepalive timeout or peer teardown)
    Closed(CloseRequest),
    /// The peer's outbound queue is gone
    PeerGone,
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Io(e) => write!(f, "i/o error: {}", e),
            ProxyError::Tls(e) => write!(f, "tls error: {}", e),
            ProxyError::WebSocket(e) => write!(f, "websocket error: {}", e),
            ProxyError::Hello(e) => write!(f, "invalid hello: {}", e),
            ProxyError::Rejected(reason) => write!(f, "rejected: {}", reason),
            ProxyError::Disconnected => write!(f, "client disconnected"),
            ProxyError::Closed(request) => write!(f, "session closed: {}", request),
            ProxyError::PeerGone => write!(f, "peer connection is gone"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Io(e) => Some(e),
            ProxyError::Tls(e) => Some(e),
            ProxyError::WebSocket(e) => Some(e),
            ProxyError::Hello(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> Self {
        ProxyError::Io(e)
    }
}

impl From<TlsError> for ProxyError {
    fn from(e: TlsError) -> Self {
        ProxyError::Tls(e)
    }
}

impl From<tungstenite::Error> for ProxyError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                ProxyError::Disconnected
            }
            other => ProxyError::WebSocket(other),
        }
    }
}

impl From<HelloError> for ProxyError {
    fn from(e: HelloError) -> Self {
        ProxyError::Hello(e)
    }
}

impl ProxyError {
    /// Whether this is an ordinary end of a session rather than a fault
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ProxyError::Disconnected | ProxyError::Closed(_) | ProxyError::PeerGone
        )
    }
}

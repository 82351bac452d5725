//! mTLS WebSocket listener
//!
//! Accepts TCP connections, completes the TLS handshake (client certificate
//! required), upgrades to WebSocket on the configured path prefix and hands
//! the connection to a [`Session`]. Each connection runs on its own task; a
//! failure on one never stops the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::error::ProxyError;
use crate::identity::identity_from_chain;
use crate::keepalive::KeepaliveConfig;
use crate::metrics::Metrics;
use crate::registry::MeetupRegistry;
use crate::session::Session;

// ============================================================================
// Constants
// ============================================================================

/// URL path under which meetup IDs are served
pub const DEFAULT_PATH_PREFIX: &str = "/micronets/v1/ws-proxy/";

/// Time allowed for the TLS handshake plus the WebSocket upgrade
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// Shared State
// ============================================================================

/// Per-listener settings every session needs
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub path_prefix: String,
    pub keepalive: KeepaliveConfig,
}

impl Default for ProxySettings {
    fn default() -> Self {
        ProxySettings {
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

/// State shared by every session of one listener
pub struct ProxyState {
    pub registry: MeetupRegistry,
    pub metrics: Metrics,
    pub settings: ProxySettings,
}

impl ProxyState {
    pub fn new(settings: ProxySettings) -> Self {
        ProxyState {
            registry: MeetupRegistry::new(),
            metrics: Metrics::new(),
            settings,
        }
    }
}

/// The meetup ID is whatever follows the prefix; it may be empty.
pub fn meetup_id_from_path<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix)
}

// ============================================================================
// Listener
// ============================================================================

pub struct ProxyServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        tls_config: Arc<ServerConfig>,
        settings: ProxySettings,
    ) -> Result<ProxyServer, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        log::info!(
            "Listening on {} (path prefix '{}', ping every {:?}, timeout {:?})",
            listener.local_addr()?,
            settings.path_prefix,
            settings.keepalive.interval,
            settings.keepalive.timeout
        );

        Ok(ProxyServer {
            listener,
            acceptor: TlsAcceptor::from(tls_config),
            state: Arc::new(ProxyState::new(settings)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    /// Accept connections forever
    pub async fn run(self) {
        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let connection = tokio::spawn(handle_connection(
                stream,
                remote_addr,
                self.acceptor.clone(),
                self.state.clone(),
            ));

            // Supervise: a panicking session must not go unnoticed
            tokio::spawn(async move {
                match connection.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::debug!("{}: connection refused: {}", remote_addr, e),
                    Err(e) if e.is_panic() => {
                        log::error!("{}: connection task panicked: {}", remote_addr, e)
                    }
                    Err(_) => {}
                }
            });
        }
    }
}

// ============================================================================
// Connection Handling
// ============================================================================

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    acceptor: TlsAcceptor,
    state: Arc<ProxyState>,
) -> Result<(), ProxyError> {
    let upgrade = async {
        let tls = acceptor.accept(stream).await?;
        let identity = identity_from_chain(tls.get_ref().1.peer_certificates());

        let mut meetup_id = None;
        let route = |request: &Request, response: Response| {
            match meetup_id_from_path(request.uri().path(), &state.settings.path_prefix) {
                Some(id) => {
                    meetup_id = Some(id.to_string());
                    Ok(response)
                }
                None => {
                    log::info!("{}: no meetup at path '{}'", remote_addr, request.uri().path());
                    let mut refusal = ErrorResponse::new(Some("Not Found".to_string()));
                    *refusal.status_mut() = StatusCode::NOT_FOUND;
                    Err(refusal)
                }
            }
        };
        let ws = accept_hdr_async(tls, route).await?;

        Ok::<_, ProxyError>((ws, meetup_id.unwrap_or_default(), identity))
    };

    let (ws, meetup_id, identity) = match tokio::time::timeout(HANDSHAKE_TIMEOUT, upgrade).await {
        Ok(result) => result?,
        Err(_) => {
            log::debug!("{}: handshake timed out", remote_addr);
            return Ok(());
        }
    };

    Session::start(ws, meetup_id, remote_addr, identity, state)
        .run()
        .await;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meetup_id_after_prefix() {
        assert_eq!(
            meetup_id_from_path("/micronets/v1/ws-proxy/room1", DEFAULT_PATH_PREFIX),
            Some("room1")
        );
    }

    #[test]
    fn test_empty_meetup_id() {
        assert_eq!(
            meetup_id_from_path("/micronets/v1/ws-proxy/", DEFAULT_PATH_PREFIX),
            Some("")
        );
    }

    #[test]
    fn test_meetup_id_keeps_nested_segments() {
        assert_eq!(
            meetup_id_from_path("/micronets/v1/ws-proxy/a/b", DEFAULT_PATH_PREFIX),
            Some("a/b")
        );
    }

    #[test]
    fn test_wrong_prefix_is_refused() {
        assert_eq!(meetup_id_from_path("/other/room1", DEFAULT_PATH_PREFIX), None);
        assert_eq!(meetup_id_from_path("/micronets/v1/ws-proxy", DEFAULT_PATH_PREFIX), None);
    }

    #[test]
    fn test_custom_prefix() {
        assert_eq!(meetup_id_from_path("/relay/xyz", "/relay/"), Some("xyz"));
    }

    #[test]
    fn test_default_settings() {
        let settings = ProxySettings::default();
        assert_eq!(settings.path_prefix, "/micronets/v1/ws-proxy/");
        assert_eq!(settings.keepalive, KeepaliveConfig::default());
    }
}

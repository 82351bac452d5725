//! End-to-end tests over real mTLS sockets
//!
//! A throwaway CA signs the proxy's certificate and the clients'
//! certificates; clients connect with tokio-rustls and tokio-tungstenite
//! exactly as a deployed peer would.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use ws_proxy::{tls, KeepaliveConfig, ProxyServer, ProxySettings, ProxyState};

type Client = WebSocketStream<TlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct Pki {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
}

impl Pki {
    fn new() -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "Micronets Test Root");
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Pki { ca_cert, ca_key }
    }

    /// Leaf certificate and key signed by the CA
    fn issue(&self, common_name: &str, dns_name: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let mut params = CertificateParams::new(vec![dns_name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, common_name);
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        (
            cert.der().clone(),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
    }

    fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert.der().clone()).unwrap();
        roots
    }
}

async fn start_proxy(pki: &Pki) -> (SocketAddr, Arc<ProxyState>) {
    let (cert, key) = pki.issue("ws-proxy", "localhost");
    let tls_config = tls::server_config(vec![cert], key, pki.roots()).unwrap();

    let settings = ProxySettings {
        keepalive: KeepaliveConfig {
            interval: Duration::ZERO,
            timeout: Duration::from_secs(10),
        },
        ..ProxySettings::default()
    };
    let server = ProxyServer::bind("127.0.0.1:0", tls_config, settings)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let state = server.state().clone();
    tokio::spawn(server.run());

    (addr, state)
}

fn client_config(pki: &Pki, identity: Option<&str>) -> Arc<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(pki.roots());

    let config = match identity {
        Some(cn) => {
            let (cert, key) = pki.issue(cn, &format!("{}.micronets.example", cn));
            builder.with_client_auth_cert(vec![cert], key).unwrap()
        }
        None => builder.with_no_client_auth(),
    };
    Arc::new(config)
}

async fn dial(
    addr: SocketAddr,
    config: Arc<ClientConfig>,
    path: &str,
) -> Result<Client, Box<dyn std::error::Error>> {
    let tcp = TcpStream::connect(addr).await?;
    let tls = TlsConnector::from(config)
        .connect(ServerName::try_from("localhost")?, tcp)
        .await?;
    let url = format!("wss://localhost:{}{}", addr.port(), path);
    let (ws, _response) = tokio_tungstenite::client_async(url.as_str(), tls).await?;
    Ok(ws)
}

fn hello(message_id: i64) -> Message {
    Message::Text(format!(
        r#"{{"message":{{"messageId":{},"messageType":"CONN:HELLO","requiresResponse":false}}}}"#,
        message_id
    ))
}

async fn recv_data(ws: &mut Client) -> Message {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read failed");
        if message.is_text() || message.is_binary() {
            return message;
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_mtls_clients_are_paired_and_relayed() {
    let pki = Pki::new();
    let (addr, state) = start_proxy(&pki).await;

    let mut a = dial(addr, client_config(&pki, Some("gateway-1")), "/micronets/v1/ws-proxy/room1")
        .await
        .unwrap();
    a.send(hello(1)).await.unwrap();
    wait_until(|| state.registry.members("room1") == 1).await;

    let mut b = dial(addr, client_config(&pki, Some("device-7")), "/micronets/v1/ws-proxy/room1")
        .await
        .unwrap();
    b.send(hello(2)).await.unwrap();

    assert_eq!(recv_data(&mut b).await, hello(1));
    assert_eq!(recv_data(&mut a).await, hello(2));

    a.send(Message::Text("ping-test".to_string())).await.unwrap();
    assert_eq!(recv_data(&mut b).await, Message::Text("ping-test".to_string()));
    b.send(Message::Binary(vec![0, 1, 2, 255])).await.unwrap();
    assert_eq!(recv_data(&mut a).await, Message::Binary(vec![0, 1, 2, 255]));

    // Certificate CNs are carried into reports
    let snapshot = state.registry.snapshot();
    let identities: Vec<&str> = snapshot["room1"].iter().map(|s| s.identity.as_str()).collect();
    assert_eq!(identities, vec!["gateway-1", "device-7"]);
}

#[tokio::test]
async fn test_unknown_path_is_refused_with_404() {
    let pki = Pki::new();
    let (addr, state) = start_proxy(&pki).await;

    let err = dial(addr, client_config(&pki, Some("gateway-1")), "/other/room1")
        .await
        .unwrap_err();
    match err.downcast_ref::<tungstenite::Error>() {
        Some(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("Expected HTTP 404, got {:?}", other),
    }

    assert_eq!(state.metrics.sessions_total.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_client_without_certificate_is_refused() {
    let pki = Pki::new();
    let (addr, state) = start_proxy(&pki).await;

    let result = dial(addr, client_config(&pki, None), "/micronets/v1/ws-proxy/room1").await;
    assert!(result.is_err());

    assert_eq!(state.metrics.sessions_total.load(Ordering::Relaxed), 0);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_client_from_unknown_ca_is_refused() {
    let pki = Pki::new();
    let stranger = Pki::new();
    let (addr, state) = start_proxy(&pki).await;

    // Trusts the proxy, but presents a certificate the proxy has never seen the issuer of
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let (cert, key) = stranger.issue("intruder", "intruder.example");
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(pki.roots())
        .with_client_auth_cert(vec![cert], key)
        .unwrap();

    let result = dial(addr, Arc::new(config), "/micronets/v1/ws-proxy/room1").await;
    assert!(result.is_err());
    assert_eq!(state.metrics.sessions_total.load(Ordering::Relaxed), 0);
}

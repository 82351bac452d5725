//! Per-connection session state
//!
//! A session is split in two:
//!
//! - [`SessionHandle`] is the shared part, held by the meetup registry and by
//!   the paired peer. It carries the outbound frame queue, the set-once close
//!   request, the peer link and the lifecycle state.
//! - [`Session`] is owned by the connection's task. It holds the read half of
//!   the WebSocket and drives the relay state machine (see `relay.rs`).
//!
//! A dedicated writer task owns the write half, so relayed frames, keepalive
//! pings and the final close frame are serialised through one queue.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::ProxyError;
use crate::hello::HelloEnvelope;
use crate::identity::ClientIdentity;
use crate::keepalive;
use crate::server::ProxyState;

// ============================================================================
// Constants
// ============================================================================

/// Close code for keepalive failure and propagated peer teardown
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Close code for every other proxy-initiated close
pub const CLOSE_NORMAL: u16 = 1000;

/// Close reason sent to a session whose peer went away
pub const PEER_DISCONNECTED_REASON: &str = "the peer websocket disconnected";

/// Frames buffered towards one client before relaying applies backpressure
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Upper bound for each write while closing (queued frames, then the close frame)
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Close Request
// ============================================================================

/// WebSocket close code and reason requested for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

impl CloseRequest {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        CloseRequest {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        CloseRequest::new(CLOSE_NORMAL, "")
    }

    fn to_message(&self) -> Message {
        Message::Close(Some(CloseFrame {
            code: CloseCode::from(self.code),
            reason: self.reason.clone().into(),
        }))
    }
}

impl fmt::Display for CloseRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Waiting for the hello frame
    Handshaking,
    /// Registered first; waiting for a peer to join the meetup
    WaitingForPeer,
    /// Paired; frames flow to the peer
    Relaying,
    /// Terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Handshaking => "handshaking",
            SessionState::WaitingForPeer => "waiting",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Read-only descriptor of a session, for reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub identity: String,
    pub state: SessionState,
    pub connected_for: Duration,
    pub peer_id: Option<u64>,
}

// ============================================================================
// Session Handle
// ============================================================================

/// The shared side of a session
pub struct SessionHandle {
    id: u64,
    meetup_id: String,
    remote_addr: SocketAddr,
    identity: ClientIdentity,
    connected_at: Instant,
    /// Frames to be written to this session's client
    outbound: mpsc::Sender<Message>,
    /// Set once; observed by the writer task and by every wait on this session
    close_tx: watch::Sender<Option<CloseRequest>>,
    /// Weak to avoid a reference cycle between the two members of a pair
    peer: OnceLock<(u64, Weak<SessionHandle>)>,
    state: Mutex<SessionState>,
}

/// Receiving ends created alongside a handle
pub struct SessionChannels {
    pub outbound_rx: mpsc::Receiver<Message>,
    pub close_rx: watch::Receiver<Option<CloseRequest>>,
}

impl SessionHandle {
    pub fn new(
        meetup_id: impl Into<String>,
        remote_addr: SocketAddr,
        identity: ClientIdentity,
    ) -> (Arc<SessionHandle>, SessionChannels) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (close_tx, close_rx) = watch::channel(None);

        let handle = Arc::new(SessionHandle {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            meetup_id: meetup_id.into(),
            remote_addr,
            identity,
            connected_at: Instant::now(),
            outbound,
            close_tx,
            peer: OnceLock::new(),
            state: Mutex::new(SessionState::Handshaking),
        });

        (
            handle,
            SessionChannels {
                outbound_rx,
                close_rx,
            },
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn meetup_id(&self) -> &str {
        &self.meetup_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Link this session to its peer. Returns false if a peer was already set.
    pub(crate) fn link_peer(&self, peer: &Arc<SessionHandle>) -> bool {
        self.peer.set((peer.id, Arc::downgrade(peer))).is_ok()
    }

    /// The linked peer, if any and still alive
    pub fn peer(&self) -> Option<Arc<SessionHandle>> {
        self.peer.get().and_then(|(_, weak)| weak.upgrade())
    }

    /// Id of the linked peer, even if it has since gone away
    pub fn peer_id(&self) -> Option<u64> {
        self.peer.get().map(|(id, _)| *id)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`. Closed is terminal: once there, this is a no-op.
    pub(crate) fn set_state(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Closed || *state == next {
            return false;
        }
        *state = next;
        true
    }

    /// Request that this session be closed with `code`/`reason`.
    ///
    /// Only the first request wins; returns false if a close was already
    /// requested. Never blocks.
    pub fn force_close(&self, code: u16, reason: impl Into<String>) -> bool {
        let request = CloseRequest::new(code, reason);
        self.close_tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(request);
            true
        })
    }

    pub fn close_request(&self) -> Option<CloseRequest> {
        self.close_tx.borrow().clone()
    }

    pub fn is_closing(&self) -> bool {
        self.close_tx.borrow().is_some()
    }

    pub fn subscribe_close(&self) -> watch::Receiver<Option<CloseRequest>> {
        self.close_tx.subscribe()
    }

    /// Queue a frame for this session's client, waiting for queue space.
    pub async fn deliver(&self, frame: Message) -> Result<(), ProxyError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ProxyError::PeerGone)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            remote_addr: self.remote_addr,
            identity: self.identity.label().to_string(),
            state: self.state(),
            connected_for: self.connected_at.elapsed(),
            peer_id: self.peer_id(),
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("meetup_id", &self.meetup_id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("peer_id", &self.peer_id())
            .finish()
    }
}

/// Resolves once a close has been requested on the watched session
pub(crate) async fn close_requested(rx: &mut watch::Receiver<Option<CloseRequest>>) -> CloseRequest {
    match rx.wait_for(Option::is_some).await {
        Ok(request) => (*request).clone().unwrap_or_else(CloseRequest::normal),
        Err(_) => CloseRequest::normal(),
    }
}

// ============================================================================
// Session (owned by the connection task)
// ============================================================================

/// The task-owned side of a session
pub struct Session<S> {
    pub(crate) handle: Arc<SessionHandle>,
    pub(crate) state: Arc<ProxyState>,
    pub(crate) stream: SplitStream<WebSocketStream<S>>,
    /// Highest pong sequence seen; read by the keepalive task
    pub(crate) pong_tx: watch::Sender<u64>,
    pub(crate) keepalive: Option<JoinHandle<()>>,
    /// Set exactly once, when the hello validates
    pub(crate) hello: Option<HelloEnvelope>,
    /// Whether this session is a member of the registry
    pub(crate) attached: bool,
    torn_down: bool,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an upgraded WebSocket: spawns the writer and starts keepalive pings.
    pub fn start(
        ws: WebSocketStream<S>,
        meetup_id: impl Into<String>,
        remote_addr: SocketAddr,
        identity: ClientIdentity,
        state: Arc<ProxyState>,
    ) -> Session<S> {
        let (handle, channels) = SessionHandle::new(meetup_id, remote_addr, identity);
        let (sink, stream) = ws.split();

        tokio::spawn(write_loop(
            handle.clone(),
            sink,
            channels.outbound_rx,
            channels.close_rx,
        ));

        let (pong_tx, pong_rx) = watch::channel(0u64);
        let keepalive = tokio::spawn(keepalive::run(
            handle.clone(),
            pong_rx,
            state.settings.keepalive.clone(),
            state.clone(),
        ));

        state.metrics.sessions_total.fetch_add(1, Ordering::Relaxed);
        state.metrics.active_sessions.fetch_add(1, Ordering::Relaxed);

        log::info!(
            "session {}: connected from {} ({}) for meetup '{}'",
            handle.id(),
            remote_addr,
            handle.identity(),
            handle.meetup_id()
        );

        Session {
            handle,
            state,
            stream,
            pong_tx,
            keepalive: Some(keepalive),
            hello: None,
            attached: false,
            torn_down: false,
        }
    }

    /// Next text or binary frame from this session's client.
    ///
    /// Pongs are acknowledged to the keepalive monitor on the way through;
    /// pings are answered by tungstenite itself.
    pub(crate) async fn next_data_frame(&mut self) -> Result<Message, ProxyError> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ProxyError::Disconnected),
            };

            match message {
                Message::Text(_) | Message::Binary(_) => return Ok(message),
                Message::Pong(payload) => self.ack_pong(&payload),
                Message::Ping(_) | Message::Frame(_) => {}
                Message::Close(frame) => {
                    log::debug!(
                        "session {}: client sent close {:?}",
                        self.handle.id(),
                        frame
                    );
                    return Err(ProxyError::Disconnected);
                }
            }
        }
    }
}

impl<S> Session<S> {
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    fn ack_pong(&self, payload: &[u8]) {
        let seq = match <[u8; 8]>::try_from(payload) {
            Ok(bytes) => u64::from_be_bytes(bytes),
            Err(_) => {
                log::trace!("session {}: ignoring unsolicited pong", self.handle.id());
                return;
            }
        };
        self.pong_tx.send_if_modified(|acked| {
            if seq > *acked {
                *acked = seq;
                true
            } else {
                false
            }
        });
    }

    /// Release everything this session holds. Idempotent; also runs on drop.
    ///
    /// Order: stop pings, leave the registry, tell the peer, then request
    /// our own close if nothing else already did.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }

        if self.attached {
            self.attached = false;
            if self
                .state
                .registry
                .detach(self.handle.meetup_id(), self.handle.id())
            {
                log::debug!(
                    "session {}: left meetup '{}'",
                    self.handle.id(),
                    self.handle.meetup_id()
                );
            }
        }

        if let Some(peer) = self.handle.peer() {
            if peer.force_close(CLOSE_PROTOCOL_ERROR, PEER_DISCONNECTED_REASON) {
                log::info!(
                    "session {}: closing peer session {}",
                    self.handle.id(),
                    peer.id()
                );
            }
        }

        self.handle.force_close(CLOSE_NORMAL, "");
        self.handle.set_state(SessionState::Closed);
        self.state
            .metrics
            .active_sessions
            .fetch_sub(1, Ordering::Relaxed);
    }
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        // Runs when the task is cancelled or panics before the normal exit path
        self.teardown();
    }
}

// ============================================================================
// Writer Task
// ============================================================================

/// Owns the write half: forwards queued frames until a close is requested,
/// then flushes what is already queued and sends the close frame.
async fn write_loop<S>(
    handle: Arc<SessionHandle>,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Message>,
    mut close_rx: watch::Receiver<Option<CloseRequest>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = loop {
        tokio::select! {
            biased;
            request = close_requested(&mut close_rx) => break request,
            frame = outbound.recv() => {
                let frame = match frame {
                    Some(frame) => frame,
                    None => break CloseRequest::normal(),
                };
                tokio::select! {
                    biased;
                    request = close_requested(&mut close_rx) => {
                        log::debug!("session {}: abandoning pending write on close", handle.id());
                        break request;
                    }
                    result = sink.send(frame) => {
                        if let Err(e) = result {
                            log::debug!("session {}: write failed: {}", handle.id(), e);
                            handle.force_close(CLOSE_NORMAL, "");
                            return;
                        }
                    }
                }
            }
        }
    };

    while let Ok(frame) = outbound.try_recv() {
        if !matches!(frame, Message::Text(_) | Message::Binary(_)) {
            continue;
        }
        match tokio::time::timeout(CLOSE_WRITE_TIMEOUT, sink.send(frame)).await {
            Ok(Ok(())) => {}
            _ => break,
        }
    }

    log::debug!("session {}: sending close {}", handle.id(), request);
    match tokio::time::timeout(CLOSE_WRITE_TIMEOUT, sink.send(request.to_message())).await {
        Ok(Ok(())) => {
            let _ = tokio::time::timeout(CLOSE_WRITE_TIMEOUT, sink.close()).await;
        }
        Ok(Err(e)) => log::debug!("session {}: close frame not sent: {}", handle.id(), e),
        Err(_) => log::debug!("session {}: close frame timed out", handle.id()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_force_close_first_request_wins() {
        let (handle, _channels) = SessionHandle::new("room", addr(), ClientIdentity::default());

        assert!(!handle.is_closing());
        assert!(handle.force_close(CLOSE_PROTOCOL_ERROR, "Ping timed out (10s)"));
        assert!(!handle.force_close(CLOSE_PROTOCOL_ERROR, PEER_DISCONNECTED_REASON));
        assert!(!handle.force_close(CLOSE_NORMAL, ""));

        assert_eq!(
            handle.close_request(),
            Some(CloseRequest::new(1002, "Ping timed out (10s)"))
        );
    }

    #[test]
    fn test_peer_link_is_set_once() {
        let (a, _ca) = SessionHandle::new("room", addr(), ClientIdentity::default());
        let (b, _cb) = SessionHandle::new("room", addr(), ClientIdentity::default());
        let (c, _cc) = SessionHandle::new("room", addr(), ClientIdentity::default());

        assert!(a.link_peer(&b));
        assert!(!a.link_peer(&c));
        assert_eq!(a.peer_id(), Some(b.id()));
        assert_eq!(a.peer().map(|p| p.id()), Some(b.id()));
    }

    #[test]
    fn test_peer_link_does_not_keep_peer_alive() {
        let (a, _ca) = SessionHandle::new("room", addr(), ClientIdentity::default());
        let (b, _cb) = SessionHandle::new("room", addr(), ClientIdentity::default());
        let b_id = b.id();
        a.link_peer(&b);
        b.link_peer(&a);

        drop(b);
        assert!(a.peer().is_none());
        assert_eq!(a.peer_id(), Some(b_id));
    }

    #[test]
    fn test_closed_state_is_terminal() {
        let (handle, _channels) = SessionHandle::new("room", addr(), ClientIdentity::default());
        assert_eq!(handle.state(), SessionState::Handshaking);

        assert!(handle.set_state(SessionState::WaitingForPeer));
        assert!(handle.set_state(SessionState::Relaying));
        assert!(handle.set_state(SessionState::Closed));
        assert!(!handle.set_state(SessionState::Closed));
        assert!(!handle.set_state(SessionState::Relaying));
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let (a, _ca) = SessionHandle::new("x", addr(), ClientIdentity::default());
        let (b, _cb) = SessionHandle::new("x", addr(), ClientIdentity::default());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_close_request_display() {
        assert_eq!(
            CloseRequest::new(1002, PEER_DISCONNECTED_REASON).to_string(),
            "1002 (the peer websocket disconnected)"
        );
        assert_eq!(CloseRequest::normal().to_string(), "1000");
    }

    #[tokio::test]
    async fn test_close_requested_sees_earlier_request() {
        let (handle, mut channels) = SessionHandle::new("room", addr(), ClientIdentity::default());
        handle.force_close(CLOSE_PROTOCOL_ERROR, PEER_DISCONNECTED_REASON);

        let request = close_requested(&mut channels.close_rx).await;
        assert_eq!(request.code, CLOSE_PROTOCOL_ERROR);
        assert_eq!(request.reason, PEER_DISCONNECTED_REASON);
    }

    #[tokio::test]
    async fn test_deliver_fails_once_writer_is_gone() {
        let (handle, channels) = SessionHandle::new("room", addr(), ClientIdentity::default());
        drop(channels.outbound_rx);

        let result = handle.deliver(Message::Text("hi".to_string())).await;
        assert!(matches!(result, Err(ProxyError::PeerGone)));
    }
}

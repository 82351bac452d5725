//! Relay engine
//!
//! Drives one session through `Handshaking → [WaitingForPeer] → Relaying`:
//!
//! 1. read and validate the hello frame;
//! 2. attach to the meetup (first arrival waits, second joins);
//! 3. forward the cached hello to the peer, then every frame after it.
//!
//! The whole sequence is raced against the session's close request, so a
//! keepalive timeout or the peer's teardown preempts any pending read, wait
//! or write. Teardown runs afterwards regardless of how the sequence ended.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::error::ProxyError;
use crate::hello::{validate_hello, HelloEnvelope};
use crate::registry::Attachment;
use crate::session::{close_requested, CloseRequest, Session, SessionHandle, SessionState};

/// Run `fut` unless a close is requested first. The close wins a tie.
pub(crate) async fn until_closed<F, T>(
    close_rx: &mut watch::Receiver<Option<CloseRequest>>,
    fut: F,
) -> Result<T, ProxyError>
where
    F: Future<Output = Result<T, ProxyError>>,
{
    tokio::select! {
        biased;
        request = close_requested(close_rx) => Err(ProxyError::Closed(request)),
        result = fut => result,
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Run the session to completion and tear it down.
    pub async fn run(mut self) {
        let mut close_rx = self.handle.subscribe_close();
        let result = until_closed(&mut close_rx, self.drive()).await;

        let id = self.handle.id();
        match &result {
            Ok(()) => log::info!("session {}: finished", id),
            Err(e) if e.is_disconnect() => log::info!("session {}: ended: {}", id, e),
            Err(e) => log::warn!("session {}: ended: {}", id, e),
        }

        self.teardown();
    }

    async fn drive(&mut self) -> Result<(), ProxyError> {
        let hello = self.recv_hello().await?;
        log::debug!(
            "session {}: hello accepted (messageId {})",
            self.handle.id(),
            hello.message_id
        );
        self.hello = Some(hello);

        let attachment = self
            .state
            .registry
            .attach(self.handle.meetup_id(), &self.handle);

        let peer = match attachment {
            Attachment::Waiter(arrival) => {
                self.attached = true;
                self.handle.set_state(SessionState::WaitingForPeer);
                self.wait_for_peer(arrival).await?
            }
            Attachment::Joiner(peer) => {
                self.attached = true;
                self.state.metrics.pairings_total.fetch_add(1, Ordering::Relaxed);
                peer
            }
            Attachment::Rejected(reason) => {
                self.state
                    .metrics
                    .rejections_total
                    .fetch_add(1, Ordering::Relaxed);
                return Err(ProxyError::Rejected(reason));
            }
        };

        self.handle.set_state(SessionState::Relaying);
        self.relay_to_peer(&peer).await
    }

    /// First data frame, which must be a valid hello
    async fn recv_hello(&mut self) -> Result<HelloEnvelope, ProxyError> {
        let frame = self.next_data_frame().await?;
        validate_hello(&frame).map_err(|e| {
            self.state
                .metrics
                .handshake_failures_total
                .fetch_add(1, Ordering::Relaxed);
            ProxyError::Hello(e)
        })
    }

    /// Keep reading our own client until the joiner arrives.
    ///
    /// Frames sent before a peer exists have nowhere to go and are dropped.
    async fn wait_for_peer(
        &mut self,
        mut arrival: oneshot::Receiver<Arc<SessionHandle>>,
    ) -> Result<Arc<SessionHandle>, ProxyError> {
        log::info!(
            "session {}: waiting for a peer on meetup '{}'",
            self.handle.id(),
            self.handle.meetup_id()
        );

        loop {
            tokio::select! {
                biased;
                peer = &mut arrival => {
                    let peer = peer.map_err(|_| ProxyError::PeerGone)?;
                    log::info!("session {}: peer session {} joined", self.handle.id(), peer.id());
                    return Ok(peer);
                }
                frame = self.next_data_frame() => {
                    let frame = frame?;
                    log::warn!(
                        "session {}: dropping {} byte frame received before a peer joined",
                        self.handle.id(),
                        frame.len()
                    );
                }
            }
        }
    }

    /// Forward the cached hello, then every later frame, to the peer in order.
    async fn relay_to_peer(&mut self, peer: &Arc<SessionHandle>) -> Result<(), ProxyError> {
        log::info!(
            "session {}: relaying to session {}",
            self.handle.id(),
            peer.id()
        );

        if let Some(hello) = &self.hello {
            self.forward(peer, hello.frame.clone()).await?;
        }
        loop {
            let frame = self.next_data_frame().await?;
            self.forward(peer, frame).await?;
        }
    }

    async fn forward(&self, peer: &SessionHandle, frame: Message) -> Result<(), ProxyError> {
        let len = frame.len();
        peer.deliver(frame).await?;
        self.state.metrics.record_relayed(len);
        Ok(())
    }
}

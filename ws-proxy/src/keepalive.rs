//! Ping/pong keepalive
//!
//! One task per session sends a WebSocket ping carrying a sequence number,
//! then waits for the session's reader to acknowledge a pong with that
//! sequence (or a later one). A missing pong force-closes the session, which
//! also cancels whatever the session task was waiting on.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ProxyError;
use crate::server::ProxyState;
use crate::session::{SessionHandle, CLOSE_PROTOCOL_ERROR};

// ============================================================================
// Constants
// ============================================================================

/// Default time between pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Default time allowed for a pong to come back
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Ping period; zero disables keepalive
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            interval: DEFAULT_PING_INTERVAL,
            timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

impl KeepaliveConfig {
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

// ============================================================================
// Scheduling
// ============================================================================

/// Delay before the next ping: the rest of the interval that started when
/// the previous ping was sent. Zero if the pong took longer than that.
pub fn next_ping_delay(sent_at: Instant, interval: Duration, pong_at: Instant) -> Duration {
    (sent_at + interval).saturating_duration_since(pong_at)
}

/// Whole seconds print without a fraction (`10`, not `10.0`)
pub fn format_secs(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        duration.as_secs().to_string()
    } else {
        duration.as_secs_f64().to_string()
    }
}

/// Close reason sent when no pong arrives in time
pub fn timeout_reason(timeout: Duration) -> String {
    format!("Ping timed out ({}s)", format_secs(timeout))
}

// ============================================================================
// Monitor Task
// ============================================================================

/// Ping `handle` until a pong is missed or the session goes away.
///
/// `pongs` carries the highest pong sequence the session's reader has seen.
pub async fn run(
    handle: Arc<SessionHandle>,
    mut pongs: watch::Receiver<u64>,
    config: KeepaliveConfig,
    state: Arc<ProxyState>,
) {
    if !config.is_enabled() {
        log::debug!("session {}: keepalive disabled", handle.id());
        return;
    }

    let mut seq: u64 = 0;
    loop {
        seq += 1;
        let sent_at = Instant::now();

        let exchange = async {
            handle
                .deliver(Message::Ping(seq.to_be_bytes().to_vec()))
                .await?;
            match pongs.wait_for(|acked| *acked >= seq).await {
                Ok(_) => Ok(()),
                Err(_) => Err(ProxyError::Disconnected),
            }
        };

        match tokio::time::timeout(config.timeout, exchange).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::trace!("session {}: keepalive stopped: {}", handle.id(), e);
                return;
            }
            Err(_) => {
                state
                    .metrics
                    .keepalive_timeouts_total
                    .fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "session {}: no pong for ping {} within {}s, closing",
                    handle.id(),
                    seq,
                    format_secs(config.timeout)
                );
                handle.force_close(CLOSE_PROTOCOL_ERROR, timeout_reason(config.timeout));
                return;
            }
        }

        let pong_at = Instant::now();
        log::trace!(
            "session {}: pong {} after {:?}",
            handle.id(),
            seq,
            pong_at.duration_since(sent_at)
        );
        tokio::time::sleep(next_ping_delay(sent_at, config.interval, pong_at)).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

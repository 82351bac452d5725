//! Process-wide proxy counters.
//!
//! Atomic counters for lock-free instrumentation from every session task.
//! Rendered as a one-line summary at the end of each registry report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Proxy counters, shared through `ProxyState`
pub struct Metrics {
    /// Sessions currently open (gauge)
    pub active_sessions: AtomicU64,
    /// WebSocket sessions accepted (counter)
    pub sessions_total: AtomicU64,
    /// Sessions closed for a missing or malformed hello (counter)
    pub handshake_failures_total: AtomicU64,
    /// Meetups that reached two members (counter)
    pub pairings_total: AtomicU64,
    /// Sessions refused by a full or draining meetup (counter)
    pub rejections_total: AtomicU64,
    /// Data frames forwarded to a peer, hellos included (counter)
    pub frames_relayed_total: AtomicU64,
    /// Payload bytes forwarded to a peer (counter)
    pub relay_bytes_total: AtomicU64,
    /// Sessions closed for a missing pong (counter)
    pub keepalive_timeouts_total: AtomicU64,
    /// Proxy start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_sessions: AtomicU64::new(0),
            sessions_total: AtomicU64::new(0),
            handshake_failures_total: AtomicU64::new(0),
            pairings_total: AtomicU64::new(0),
            rejections_total: AtomicU64::new(0),
            frames_relayed_total: AtomicU64::new(0),
            relay_bytes_total: AtomicU64::new(0),
            keepalive_timeouts_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Count one forwarded frame of `len` payload bytes
    pub fn record_relayed(&self, len: usize) {
        self.frames_relayed_total.fetch_add(1, Ordering::Relaxed);
        self.relay_bytes_total.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Render the counters as a single human-readable line.
    pub fn summary(&self) -> String {
        format!(
            "active={} accepted={} handshake_failures={} pairings={} rejections={} \
             frames_relayed={} bytes_relayed={} keepalive_timeouts={} uptime={}s",
            self.active_sessions.load(Ordering::Relaxed),
            self.sessions_total.load(Ordering::Relaxed),
            self.handshake_failures_total.load(Ordering::Relaxed),
            self.pairings_total.load(Ordering::Relaxed),
            self.rejections_total.load(Ordering::Relaxed),
            self.frames_relayed_total.load(Ordering::Relaxed),
            self.relay_bytes_total.load(Ordering::Relaxed),
            self.keepalive_timeouts_total.load(Ordering::Relaxed),
            self.start_time.elapsed().as_secs(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

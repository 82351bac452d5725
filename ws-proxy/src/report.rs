//! Registry reports
//!
//! A read-only dump of every meetup and its sessions plus the proxy counters,
//! logged periodically and on `SIGUSR1`.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::metrics::Metrics;
use crate::server::ProxyState;
use crate::session::SessionInfo;

/// Render a registry snapshot and counters as indented text
pub fn render_report(snapshot: &BTreeMap<String, Vec<SessionInfo>>, metrics: &Metrics) -> String {
    let sessions: usize = snapshot.values().map(Vec::len).sum();
    let mut out = format!(
        "Meetup report: {} meetup(s), {} session(s)\n",
        snapshot.len(),
        sessions
    );

    if snapshot.is_empty() {
        out.push_str("  (no meetups)\n");
    }

    for (meetup_id, members) in snapshot {
        out.push_str(&format!("  meetup '{}':\n", meetup_id));
        for info in members {
            let pairing = match info.peer_id {
                Some(peer) => format!("paired with {}", peer),
                None => "unpaired".to_string(),
            };
            out.push_str(&format!(
                "    session {} from {} cn={} state={} connected {}s, {}\n",
                info.id,
                info.remote_addr,
                info.identity,
                info.state,
                info.connected_for.as_secs(),
                pairing
            ));
        }
    }

    out.push_str(&format!("  counters: {}\n", metrics.summary()));
    out
}

pub fn log_report(state: &ProxyState) {
    let report = render_report(&state.registry.snapshot(), &state.metrics);
    log::info!("{}", report.trim_end());
}

/// Log a report every `interval`. Returns `None` when the interval is zero.
pub fn spawn_periodic_reports(state: Arc<ProxyState>, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            log_report(&state);
        }
    }))
}

/// Log a report whenever the process receives `SIGUSR1`.
#[cfg(unix)]
pub fn install_report_signal(state: Arc<ProxyState>) -> io::Result<()> {
    use signal_hook::consts::SIGUSR1;
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGUSR1])?;
    std::thread::Builder::new()
        .name("report-signal".to_string())
        .spawn(move || {
            for _ in signals.forever() {
                log_report(&state);
            }
        })?;

    log::debug!("SIGUSR1 will log a registry report");
    Ok(())
}

#[cfg(not(unix))]
pub fn install_report_signal(_state: Arc<ProxyState>) -> io::Result<()> {
    Ok(())
}

//! Meetup registry
//!
//! Maps a meetup ID to the (at most two) sessions that connected with it. The
//! first session to attach becomes the waiter; the second becomes the joiner
//! and is paired with the waiter in the same locked operation, so neither
//! side can observe a half-made pair.
//!
//! The lock is a plain `std::sync::Mutex` and is never held across an
//! `.await`: every operation here is a short in-memory update.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::session::{SessionHandle, SessionInfo};

// ============================================================================
// Constants
// ============================================================================

/// Sessions allowed per meetup ID
pub const MAX_MEETUP_MEMBERS: usize = 2;

// ============================================================================
// Types
// ============================================================================

/// Why an attach was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The meetup already has two members
    Full,
    /// The remaining member belongs to a pair that is being torn down
    Draining,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Full => write!(f, "meetup already has {} clients", MAX_MEETUP_MEMBERS),
            RejectReason::Draining => write!(f, "meetup is closing its previous pair"),
        }
    }
}

/// Result of attaching a session to a meetup
#[derive(Debug)]
pub enum Attachment {
    /// First arrival: the receiver fires with the joiner's handle
    Waiter(oneshot::Receiver<Arc<SessionHandle>>),
    /// Second arrival: already paired with this waiter
    Joiner(Arc<SessionHandle>),
    /// Not admitted; nothing was changed
    Rejected(RejectReason),
}

struct Member {
    handle: Arc<SessionHandle>,
    /// Waiter only; consumed by the joiner, so it can fire at most once
    peer_arrival: Option<oneshot::Sender<Arc<SessionHandle>>>,
}

// ============================================================================
// Registry Structure
// ============================================================================

/// Process-wide meetup table
pub struct MeetupRegistry {
    meetups: Mutex<HashMap<String, Vec<Member>>>,
}

impl MeetupRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        MeetupRegistry {
            meetups: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Member>>> {
        self.meetups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a session to its meetup.
    ///
    /// The joiner case links both handles to each other and signals the
    /// waiter before the lock is released.
    pub fn attach(&self, meetup_id: &str, handle: &Arc<SessionHandle>) -> Attachment {
        let mut meetups = self.lock();
        let members = meetups.entry(meetup_id.to_string()).or_default();

        let waiter = match members.len() {
            0 => {
                let (tx, rx) = oneshot::channel();
                members.push(Member {
                    handle: handle.clone(),
                    peer_arrival: Some(tx),
                });
                log::info!(
                    "session {}: first to meetup '{}', waiting for a peer",
                    handle.id(),
                    meetup_id
                );
                return Attachment::Waiter(rx);
            }
            1 => &mut members[0],
            _ => {
                log::warn!(
                    "session {}: meetup '{}' already has {} clients",
                    handle.id(),
                    meetup_id,
                    members.len()
                );
                return Attachment::Rejected(RejectReason::Full);
            }
        };

        if waiter.handle.peer_id().is_some() || waiter.handle.is_closing() {
            log::warn!(
                "session {}: meetup '{}' is still closing session {}",
                handle.id(),
                meetup_id,
                waiter.handle.id()
            );
            return Attachment::Rejected(RejectReason::Draining);
        }

        handle.link_peer(&waiter.handle);
        waiter.handle.link_peer(handle);
        if let Some(peer_arrival) = waiter.peer_arrival.take() {
            if peer_arrival.send(handle.clone()).is_err() {
                log::debug!(
                    "session {}: waiter {} stopped waiting before pairing",
                    handle.id(),
                    waiter.handle.id()
                );
            }
        }

        let waiter_handle = waiter.handle.clone();
        members.push(Member {
            handle: handle.clone(),
            peer_arrival: None,
        });

        log::info!(
            "session {}: paired with session {} on meetup '{}'",
            handle.id(),
            waiter_handle.id(),
            meetup_id
        );
        Attachment::Joiner(waiter_handle)
    }

    /// Remove a session from its meetup, dropping the meetup once empty.
    ///
    /// Returns false if the session was not a member (already detached).
    pub fn detach(&self, meetup_id: &str, session_id: u64) -> bool {
        let mut meetups = self.lock();
        let members = match meetups.get_mut(meetup_id) {
            Some(members) => members,
            None => return false,
        };

        let before = members.len();
        members.retain(|m| m.handle.id() != session_id);
        let removed = members.len() != before;

        if members.is_empty() {
            meetups.remove(meetup_id);
            log::debug!("meetup '{}' is now empty", meetup_id);
        }

        removed
    }

    /// Copy of the table for reporting
    pub fn snapshot(&self) -> BTreeMap<String, Vec<SessionInfo>> {
        let handles: Vec<(String, Vec<Arc<SessionHandle>>)> = {
            let meetups = self.lock();
            meetups
                .iter()
                .map(|(id, members)| {
                    (id.clone(), members.iter().map(|m| m.handle.clone()).collect())
                })
                .collect()
        };

        // Session state is read after the registry lock is released
        handles
            .into_iter()
            .map(|(id, members)| (id, members.iter().map(|h| h.info()).collect()))
            .collect()
    }

    /// Number of meetups with at least one member
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Total sessions across all meetups
    pub fn session_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    /// Number of sessions attached to one meetup
    pub fn members(&self, meetup_id: &str) -> usize {
        self.lock().get(meetup_id).map_or(0, Vec::len)
    }
}

impl Default for MeetupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

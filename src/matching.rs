//! # Match Tracker
//!
//! Counts the remote peers matched to each local endpoint role and lets the
//! controller block until a predicate over those counts holds.
//!
//! Counts are only mutated from the transport's matching callback and only
//! read while holding the same mutex. Waiters sleep on a condition variable;
//! nothing here polls.

use crate::transport::{EndpointId, EndpointListener, MatchStatus};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Logical role of a local endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    /// Reader on the data channel under measurement
    Data,
    /// Writer on the control channel (subscriber to publisher)
    CommandSend,
    /// Reader on the control channel (publisher to subscriber)
    CommandReceive,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRole::Data => write!(f, "data"),
            EndpointRole::CommandSend => write!(f, "command-send"),
            EndpointRole::CommandReceive => write!(f, "command-receive"),
        }
    }
}

/// Matched-peer counts per role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchCounts {
    data: usize,
    command_send: usize,
    command_receive: usize,
}

impl MatchCounts {
    pub fn get(&self, role: EndpointRole) -> usize {
        match role {
            EndpointRole::Data => self.data,
            EndpointRole::CommandSend => self.command_send,
            EndpointRole::CommandReceive => self.command_receive,
        }
    }

    /// Matches across both control-channel endpoints
    pub fn command_total(&self) -> usize {
        self.command_send + self.command_receive
    }

    fn slot_mut(&mut self, role: EndpointRole) -> &mut usize {
        match role {
            EndpointRole::Data => &mut self.data,
            EndpointRole::CommandSend => &mut self.command_send,
            EndpointRole::CommandReceive => &mut self.command_receive,
        }
    }
}

/// Thread-safe matched-peer counter with a waitable predicate
pub struct MatchTracker {
    group: &'static str,
    counts: Mutex<MatchCounts>,
    changed: Condvar,
}

impl MatchTracker {
    /// Create a tracker for one channel group (e.g. "data" or "command")
    pub fn new(group: &'static str) -> Self {
        Self {
            group,
            counts: Mutex::new(MatchCounts::default()),
            changed: Condvar::new(),
        }
    }

    /// Apply a +1/-1 matching delta for `role` and wake all waiters
    pub fn on_match_change(&self, role: EndpointRole, delta: i32) {
        let mut counts = self.counts.lock();
        let slot = counts.slot_mut(role);
        if delta >= 0 {
            *slot += delta as usize;
        } else {
            let decrement = delta.unsigned_abs() as usize;
            if decrement > *slot {
                warn!(
                    "{} tracker: unmatch on {} with count {}, clamping to 0",
                    self.group, role, *slot
                );
                *slot = 0;
            } else {
                *slot -= decrement;
            }
        }
        debug!(
            "{} tracker: {} matched peers now {}",
            self.group, role, *slot
        );
        self.changed.notify_all();
    }

    /// Current counts
    pub fn counts(&self) -> MatchCounts {
        *self.counts.lock()
    }

    /// Block until `predicate` holds over the current counts
    ///
    /// With `timeout == None` the wait is unbounded, which is what the
    /// discovery barriers use. Returns false only when the timeout elapsed
    /// with the predicate still false.
    pub fn wait_until<F>(&self, mut predicate: F, timeout: Option<Duration>) -> bool
    where
        F: FnMut(&MatchCounts) -> bool,
    {
        let mut counts = self.counts.lock();
        match timeout {
            None => {
                self.changed
                    .wait_while(&mut counts, |current| !predicate(&*current));
                true
            }
            Some(limit) => {
                let result =
                    self.changed
                        .wait_while_for(&mut counts, |current| !predicate(&*current), limit);
                !result.timed_out() || predicate(&*counts)
            }
        }
    }
}

/// Listener that only forwards matching changes into a tracker
///
/// Used for the control-channel endpoints, whose messages are polled by the
/// controller rather than consumed in a callback.
pub struct MatchListener {
    role: EndpointRole,
    tracker: Arc<MatchTracker>,
}

impl MatchListener {
    pub fn new(role: EndpointRole, tracker: Arc<MatchTracker>) -> Self {
        Self { role, tracker }
    }
}

impl EndpointListener for MatchListener {
    fn on_match_changed(&self, endpoint: EndpointId, status: MatchStatus) {
        debug!(
            "{} ({}) matching changed: {} peers ({:+})",
            endpoint, self.role, status.current_count, status.current_count_change
        );
        self.tracker
            .on_match_change(self.role, status.current_count_change);
    }
}

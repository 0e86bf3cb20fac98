//! Local read boundary and the reliable `mark_read` state machine.
//!
//! ```text
//!            request(id > last_read)
//!   Idle ───────────────────────────► Sending
//!    ▲                                  │ send over channel
//!    │                       ┌──────────┴──────────┐
//!    │                    sent                  not open
//!    │                       ▼                     ▼
//!    │                 Acknowledged          Retrying{attempt}
//!    │                                         │  every 250ms
//!    │                                         │  up to ~6s
//!    └─────────── abandon() ◄── Exhausted ◄────┘ (HTTP fallback)
//! ```
//!
//! The channel may still be finishing its handshake when the first
//! `mark_read` is due, hence the short bounded retry instead of failing.

use std::time::Duration;

use crate::protocol::MessageId;

/// Per-thread read boundary.
///
/// `last_acknowledged_id <= last_read_id` always holds; both only grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadBoundary {
    last_read_id: Option<MessageId>,
    last_acknowledged_id: Option<MessageId>,
}

impl ReadBoundary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_read_id(&self) -> Option<MessageId> {
        self.last_read_id
    }

    pub fn last_acknowledged_id(&self) -> Option<MessageId> {
        self.last_acknowledged_id
    }

    /// Raise the local boundary. Returns `false` for stale or repeated ids.
    fn advance_read(&mut self, id: MessageId) -> bool {
        if self.last_read_id.is_some_and(|r| id <= r) {
            return false;
        }
        self.last_read_id = Some(id);
        true
    }

    /// Raise the acknowledged boundary, clamped to the local one.
    fn advance_ack(&mut self, id: MessageId) {
        let Some(read) = self.last_read_id else {
            return;
        };
        let id = id.min(read);
        if self.last_acknowledged_id.map_or(true, |a| id > a) {
            self.last_acknowledged_id = Some(id);
        }
    }

    /// A boundary the server has not confirmed yet.
    pub fn unacknowledged(&self) -> Option<MessageId> {
        match (self.last_read_id, self.last_acknowledged_id) {
            (Some(read), Some(ack)) if read > ack => Some(read),
            (Some(read), None) => Some(read),
            _ => None,
        }
    }
}

/// Retry budget for sends attempted while the channel is not open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Retry every `interval` for at most `window`.
    pub fn new(interval: Duration, window: Duration) -> Self {
        let attempts = if interval.is_zero() {
            1
        } else {
            (window.as_millis() / interval.as_millis().max(1)) as u32
        };
        Self {
            interval,
            max_attempts: attempts.max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(6))
    }
}

/// Phase of the mark-read state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    Idle,
    Sending,
    Retrying { attempt: u32 },
    Acknowledged,
}

/// What the caller should do after a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Nothing left to send
    Done,
    /// Try the channel again after the delay
    RetryAfter(Duration),
    /// Budget spent; fall back to the HTTP collaborator
    Exhausted(MessageId),
}

/// Tracks the local read boundary and drives `mark_read` delivery.
#[derive(Debug)]
pub struct ReadTracker {
    boundary: ReadBoundary,
    phase: ReadPhase,
    policy: RetryPolicy,
    in_flight: Option<MessageId>,
}

impl ReadTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            boundary: ReadBoundary::new(),
            phase: ReadPhase::Idle,
            policy,
            in_flight: None,
        }
    }

    pub fn boundary(&self) -> ReadBoundary {
        self.boundary
    }

    pub fn phase(&self) -> ReadPhase {
        self.phase
    }

    pub fn in_flight(&self) -> Option<MessageId> {
        self.in_flight
    }

    /// Ask to mark everything up to `last_id` read.
    ///
    /// Returns the id to send, or `None` when `last_id` does not advance
    /// the boundary. A newer id replaces one still retrying and resets
    /// the retry budget.
    pub fn request(&mut self, last_id: MessageId) -> Option<MessageId> {
        if !self.boundary.advance_read(last_id) {
            log::trace!(
                "mark_read {last_id} suppressed (boundary {:?})",
                self.boundary.last_read_id
            );
            return None;
        }
        self.in_flight = Some(last_id);
        self.phase = ReadPhase::Sending;
        Some(last_id)
    }

    /// Record the outcome of handing the intent to the push channel.
    pub fn on_attempt(&mut self, sent: bool) -> RetryStep {
        let Some(id) = self.in_flight else {
            return RetryStep::Done;
        };

        if sent {
            self.acknowledge(id);
            return RetryStep::Done;
        }

        let attempt = match self.phase {
            ReadPhase::Retrying { attempt } => attempt + 1,
            _ => 1,
        };
        if attempt >= self.policy.max_attempts {
            log::debug!("mark_read {id}: channel still closed after {attempt} attempts");
            self.phase = ReadPhase::Retrying { attempt };
            return RetryStep::Exhausted(id);
        }
        self.phase = ReadPhase::Retrying { attempt };
        RetryStep::RetryAfter(self.policy.interval)
    }

    /// The server confirmed everything up to `id`.
    pub fn acknowledge(&mut self, id: MessageId) {
        self.boundary.advance_ack(id);
        if self.in_flight.is_some_and(|f| f <= id) {
            self.in_flight = None;
            self.phase = ReadPhase::Acknowledged;
        }
    }

    /// Give up on the in-flight intent; the boundary stays pending and
    /// is re-sent by [`ReadTracker::pending`].
    pub fn abandon(&mut self) {
        self.in_flight = None;
        self.phase = ReadPhase::Idle;
    }

    /// Re-issue an unacknowledged boundary (e.g. after the channel opens).
    pub fn pending(&mut self) -> Option<MessageId> {
        if self.in_flight.is_some() {
            return None;
        }
        let pending = self.boundary.unacknowledged()?;
        self.in_flight = Some(pending);
        self.phase = ReadPhase::Sending;
        Some(pending)
    }
}

impl Default for ReadTracker {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

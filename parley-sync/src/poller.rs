//! Fallback polling while the push channel is unavailable.
//!
//! ```text
//!   ConnectionState ──► FallbackPolicy ──► Start / Stop / Keep
//!                                             │
//!                                             ▼
//!   tick ──► FallbackPoller::begin() ──► PollTicket{generation, seq}
//!                                             │  HTTP request in flight
//!                                             ▼
//!   response ──► accept(&ticket)? ──yes──► normalized InboundEvents
//!                      │
//!                      no (older than latest started poll, or stopped)
//!                      ▼
//!                   discarded
//! ```
//!
//! Both types are plain state; the session task owns the timers and the
//! requests. Duplicates between push and poll are expected and absorbed
//! downstream by the timeline, never prevented here.

use std::time::Duration;
use tokio::time::Instant;

use crate::channel::ConnectionState;

/// Identifies one poll request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTicket {
    generation: u64,
    seq: u64,
}

impl PollTicket {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Start/stop state and response ordering for periodic polls.
#[derive(Debug, Default)]
pub struct FallbackPoller {
    interval: Option<Duration>,
    /// Bumped on every start/stop; tickets from older generations are stale
    generation: u64,
    next_seq: u64,
    latest_started: Option<u64>,
}

impl FallbackPoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin polling every `interval`. Returns `false` if already active.
    pub fn start(&mut self, interval: Duration) -> bool {
        if self.interval.is_some() {
            return false;
        }
        self.generation += 1;
        self.interval = Some(interval);
        log::info!("Fallback polling started ({}ms)", interval.as_millis());
        true
    }

    /// Halt polling. Responses still in flight will be rejected.
    pub fn stop(&mut self) -> bool {
        if self.interval.take().is_none() {
            return false;
        }
        self.generation += 1;
        self.latest_started = None;
        log::info!("Fallback polling stopped");
        true
    }

    pub fn is_active(&self) -> bool {
        self.interval.is_some()
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Issue a ticket for a poll about to be sent. `None` when stopped.
    pub fn begin(&mut self) -> Option<PollTicket> {
        self.interval?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.latest_started = Some(seq);
        Some(PollTicket {
            generation: self.generation,
            seq,
        })
    }

    /// Whether a response for `ticket` may be applied.
    ///
    /// Only the most recently started poll of the current generation is
    /// accepted; a slow request overtaken by a newer one is dropped.
    pub fn accept(&self, ticket: &PollTicket) -> bool {
        let fresh = ticket.generation == self.generation && self.latest_started == Some(ticket.seq);
        if !fresh {
            log::debug!("Discarding stale poll response #{}", ticket.seq);
        }
        fresh
    }
}

/// What the policy wants done with the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Start,
    Stop,
    Keep,
}

/// Maps channel state transitions to poller activation.
///
/// Polling starts when the channel closes, or when it stays
/// `Connecting` longer than the grace period. It stops on `Open`.
#[derive(Debug)]
pub struct FallbackPolicy {
    grace: Duration,
    connecting_since: Option<Instant>,
}

impl FallbackPolicy {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            connecting_since: None,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Feed a channel state observed at `now`.
    pub fn on_state(&mut self, state: ConnectionState, now: Instant) -> PolicyDecision {
        match state {
            ConnectionState::Open => {
                self.connecting_since = None;
                PolicyDecision::Stop
            }
            ConnectionState::Closed => {
                self.connecting_since = None;
                PolicyDecision::Start
            }
            ConnectionState::Connecting => {
                let since = *self.connecting_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= self.grace {
                    PolicyDecision::Start
                } else {
                    PolicyDecision::Keep
                }
            }
        }
    }

    /// When the grace period runs out, if the channel is still connecting.
    pub fn grace_deadline(&self) -> Option<Instant> {
        self.connecting_since.map(|since| since + self.grace)
    }

    /// Re-evaluate once the grace deadline has passed.
    pub fn on_grace_elapsed(&mut self, now: Instant) -> PolicyDecision {
        match self.connecting_since {
            Some(since) if now.saturating_duration_since(since) >= self.grace => {
                log::debug!("Channel still connecting after {:?}", self.grace);
                // Fire once; a later Connecting transition re-arms it
                self.connecting_since = None;
                PolicyDecision::Start
            }
            _ => PolicyDecision::Keep,
        }
    }
}

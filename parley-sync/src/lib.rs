//! # parley-sync: Client-side realtime messaging sync core
//!
//! Keeps an open conversation view, its read state and the global unread
//! badge consistent with the server over one shared push WebSocket, with
//! HTTP polling as the fallback while that socket is down.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON frames   ┌──────────────┐   BusEvent   ┌──────────────┐
//! │ push server  │ ──────────────► │ PushChannel  │ ───────────► │  EventBus    │
//! └──────────────┘ ◄────────────── └──────────────┘              └──────┬───────┘
//!                   mark_read /                                        │
//!                   get_unread                        ┌────────────────┴────────────┐
//!                                                     ▼                             ▼
//!                                             ┌──────────────┐              ┌──────────────┐
//!                                             │ unread loop  │              │ ThreadDriver │
//!                                             │ + poller     │              │ reconciler   │
//!                                             └──────┬───────┘              │ tracker      │
//!                                                    │                      │ poller       │
//!                                                    ▼                      └──────┬───────┘
//!                                             watch<Unread>                        │ Effect
//!                                                                                  ▼
//!                                                                             host page
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire events and commands
//! - [`thread`]: thread identity and event correlation
//! - [`timeline`]: idempotent, insertion-ordered message log
//! - [`read_state`]: monotonic read boundary with bounded retry
//! - [`bus`]: in-process fan-out of push events and connection state
//! - [`channel`]: the single WebSocket with reconnect
//! - [`poller`]: fallback polling with stale-response protection
//! - [`http`]: send / poll / unread / mark-read endpoints
//! - [`reconciler`]: per-view state machine producing [`Effect`]s
//! - [`session`]: page session wiring it all together
//!
//! ## Guarantees
//!
//! | Property | Where |
//! |----------|-------|
//! | A message id renders at most once per view | [`TimelineStore::append`] |
//! | Read boundaries never move backwards | [`ReadTracker::request`] |
//! | Stale poll responses are discarded | [`FallbackPoller::accept`] |
//! | Nothing mutates a closed view | [`ViewToken`] |

pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod http;
pub mod poller;
pub mod protocol;
pub mod read_state;
pub mod reconciler;
pub mod session;
pub mod thread;
pub mod timeline;

// Re-exports for convenience
pub use bus::{BusEvent, BusStats, EventBus, Filter, Subscription};
pub use channel::{ChannelStats, ConnectionState, PushChannel};
pub use config::{Endpoints, SyncConfig};
pub use error::{ConfigError, ErrorCategory, SyncError, SyncResult};
pub use http::{
    Attachment, HttpApi, HttpError, OutgoingMessage, PolledMessage, ReqwestApi, SendError,
    SentMessage, ThreadDelta,
};
pub use poller::{FallbackPoller, FallbackPolicy, PolicyDecision, PollTicket};
pub use protocol::{EventKind, InboundEvent, MessageId, OutboundCommand, ProtocolError};
pub use read_state::{ReadBoundary, ReadPhase, ReadTracker, RetryPolicy, RetryStep};
pub use reconciler::{
    Composer, DeliveryReconciler, Effect, ScrollGeometry, ViewState, ViewToken,
};
pub use session::{
    Session, ThreadCommand, ThreadHandle, UnreadCounter, UnreadSnapshot,
};
pub use thread::{ThreadContext, ThreadKey};
pub use timeline::{AppendOutcome, Direction, MessageEntry, TimelineStore};

//! JSON wire format shared by the push channel and the poll path.
//!
//! Every frame is a JSON object discriminated by its `type` field:
//! ```text
//! server → client                         client → server
//! ┌───────────────────────────┐          ┌──────────────────────────────┐
//! │ message_new               │          │ mark_read {chat_id?, last_id?,│
//! │ chat_read                 │          │            ids?}             │
//! │ unread_total              │          │ get_unread {}                │
//! │ chat_renamed / member_*   │          └──────────────────────────────┘
//! │ chat_access_revoked       │
//! │ chat_updated              │
//! └───────────────────────────┘
//! ```
//!
//! Message HTML is an opaque blob here. Unknown `type` values decode to
//! [`InboundEvent::Unknown`] so that a newer server never breaks the loop.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned message identifier.
///
/// Ids are "monotonic-ish": they grow on the server, but arrival order
/// across push and poll is not guaranteed to follow them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Discriminant of an [`InboundEvent`], used for subscribe-by-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageNew,
    ChatRead,
    UnreadTotal,
    ChatRenamed,
    ChatMemberAdded,
    ChatMemberRemoved,
    ChatAccessRevoked,
    ChatUpdated,
    Unknown,
}

/// Normalized inbound event, produced by both the push channel and the
/// fallback poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// A message was posted to some thread the user belongs to.
    MessageNew {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        other_username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        #[serde(default)]
        html: String,
        /// `true` when authored by someone other than the local user
        #[serde(default)]
        incoming: bool,
        /// Refreshed inbox list fragment, when the server bundles it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inbox_html: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unread_total: Option<u64>,
    },
    /// A participant advanced their read boundary.
    ChatRead {
        chat_id: u64,
        reader_id: u64,
        last_read_id: MessageId,
    },
    /// Global unread counter for the local user.
    UnreadTotal {
        count: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated: Option<u64>,
    },
    ChatRenamed {
        chat_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    ChatMemberAdded {
        chat_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<u64>,
    },
    ChatMemberRemoved {
        chat_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<u64>,
    },
    /// The local user lost access to the thread (kicked, chat deleted).
    ChatAccessRevoked {
        chat_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        redirect_url: Option<String>,
    },
    /// Generic metadata change; `refresh_header` asks for a header reload.
    ChatUpdated {
        chat_id: u64,
        #[serde(default)]
        refresh_header: bool,
    },
    #[serde(other)]
    Unknown,
}

impl InboundEvent {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Encode to a text frame (used by tests and the poll adapter).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageNew { .. } => EventKind::MessageNew,
            Self::ChatRead { .. } => EventKind::ChatRead,
            Self::UnreadTotal { .. } => EventKind::UnreadTotal,
            Self::ChatRenamed { .. } => EventKind::ChatRenamed,
            Self::ChatMemberAdded { .. } => EventKind::ChatMemberAdded,
            Self::ChatMemberRemoved { .. } => EventKind::ChatMemberRemoved,
            Self::ChatAccessRevoked { .. } => EventKind::ChatAccessRevoked,
            Self::ChatUpdated { .. } => EventKind::ChatUpdated,
            Self::Unknown => EventKind::Unknown,
        }
    }

    /// Message id carried by the event, if any.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::MessageNew { message_id, .. } => *message_id,
            _ => None,
        }
    }

    /// Chat id carried by the event, if any.
    pub fn chat_id(&self) -> Option<u64> {
        match self {
            Self::MessageNew { chat_id, .. } => *chat_id,
            Self::ChatRead { chat_id, .. }
            | Self::ChatRenamed { chat_id, .. }
            | Self::ChatMemberAdded { chat_id, .. }
            | Self::ChatMemberRemoved { chat_id, .. }
            | Self::ChatAccessRevoked { chat_id, .. }
            | Self::ChatUpdated { chat_id, .. } => Some(*chat_id),
            Self::UnreadTotal { .. } | Self::Unknown => None,
        }
    }

    /// Chat metadata events (rename, membership, access, header refresh).
    pub fn is_chat_event(&self) -> bool {
        matches!(
            self.kind(),
            EventKind::ChatRenamed
                | EventKind::ChatMemberAdded
                | EventKind::ChatMemberRemoved
                | EventKind::ChatAccessRevoked
                | EventKind::ChatUpdated
        )
    }
}

/// Client → server commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundCommand {
    /// Advance the local read boundary.
    ///
    /// Chat-addressed threads send `chat_id` + `last_id`; peer-addressed
    /// threads without a known chat id send explicit `ids`.
    MarkRead {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_id: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ids: Option<Vec<MessageId>>,
    },
    /// Ask the server to push a fresh `unread_total`.
    GetUnread,
}

impl OutboundCommand {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors. Always recoverable: the offending frame is dropped.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Unexpected binary frame ({0} bytes)")]
    UnexpectedBinary(usize),
}

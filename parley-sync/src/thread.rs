//! Identity of the open thread view and event correlation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;
use crate::protocol::{MessageId, OutboundCommand};

/// Correlation key of a thread.
///
/// Group chats (and newer deployments) address dialogs by chat id;
/// legacy direct dialogs are addressed by the peer's username.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKey {
    Chat(u64),
    Peer(String),
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat(id) => write!(f, "chat:{id}"),
            Self::Peer(name) => write!(f, "peer:{name}"),
        }
    }
}

/// Immutable per-open-thread identity.
///
/// At least one of `thread_id` / `peer_identifier` is always present;
/// deserialization goes through the same check as [`ThreadContext::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawThreadContext")]
pub struct ThreadContext {
    thread_id: Option<u64>,
    peer_identifier: Option<String>,
    local_user_id: u64,
    /// Id of the last message rendered server-side when the page opened
    initial_last_id: Option<MessageId>,
}

/// Shape passed in by the hosting page.
#[derive(Debug, Deserialize)]
struct RawThreadContext {
    #[serde(default)]
    thread_id: Option<u64>,
    #[serde(default)]
    peer_identifier: Option<String>,
    local_user_id: u64,
    #[serde(default)]
    initial_last_id: Option<MessageId>,
}

impl TryFrom<RawThreadContext> for ThreadContext {
    type Error = ConfigError;

    fn try_from(raw: RawThreadContext) -> Result<Self, Self::Error> {
        let mut ctx = Self::new(raw.thread_id, raw.peer_identifier, raw.local_user_id)?;
        ctx.initial_last_id = raw.initial_last_id;
        Ok(ctx)
    }
}

impl ThreadContext {
    /// Build a context. At least one of `thread_id` / `peer_identifier`
    /// is required; an empty username counts as absent.
    pub fn new(
        thread_id: Option<u64>,
        peer_identifier: Option<String>,
        local_user_id: u64,
    ) -> Result<Self, ConfigError> {
        let peer_identifier = peer_identifier.filter(|p| !p.is_empty());
        if thread_id.is_none() && peer_identifier.is_none() {
            return Err(ConfigError::MissingThreadKey);
        }
        Ok(Self {
            thread_id,
            peer_identifier,
            local_user_id,
            initial_last_id: None,
        })
    }

    pub fn chat(chat_id: u64, local_user_id: u64) -> Self {
        Self {
            thread_id: Some(chat_id),
            peer_identifier: None,
            local_user_id,
            initial_last_id: None,
        }
    }

    pub fn peer(username: impl Into<String>, local_user_id: u64) -> Self {
        Self {
            thread_id: None,
            peer_identifier: Some(username.into()),
            local_user_id,
            initial_last_id: None,
        }
    }

    /// Record the last server-rendered message id.
    pub fn with_initial_last_id(mut self, id: MessageId) -> Self {
        self.initial_last_id = Some(id);
        self
    }

    pub fn thread_id(&self) -> Option<u64> {
        self.thread_id
    }

    pub fn peer_identifier(&self) -> Option<&str> {
        self.peer_identifier.as_deref()
    }

    pub fn local_user_id(&self) -> u64 {
        self.local_user_id
    }

    pub fn initial_last_id(&self) -> Option<MessageId> {
        self.initial_last_id
    }

    /// The correlation key. Chat id wins when both are present.
    pub fn key(&self) -> ThreadKey {
        match self.thread_id {
            Some(id) => ThreadKey::Chat(id),
            None => ThreadKey::Peer(self.peer_identifier.clone().unwrap_or_default()),
        }
    }

    /// Whether an event addressed by `(chat_id, other_username)` belongs
    /// to this thread.
    ///
    /// With a chat id on both sides, ids must be equal. Only when this
    /// context has no chat id is the peer username consulted.
    pub fn matches(&self, chat_id: Option<u64>, other_username: Option<&str>) -> bool {
        match self.thread_id {
            Some(own) => chat_id == Some(own),
            None => match (&self.peer_identifier, other_username) {
                (Some(own), Some(other)) => own == other,
                _ => false,
            },
        }
    }

    /// Whether a chat-scoped metadata event targets this thread.
    pub fn matches_chat(&self, chat_id: u64) -> bool {
        self.thread_id == Some(chat_id)
    }

    /// The `mark_read` command for a boundary in this thread.
    ///
    /// Peer-addressed dialogs have no boundary on the wire: the server
    /// marks exactly the listed ids. `unread` carries the incoming ids the
    /// boundary covers that were not acknowledged yet; `last_id` is always
    /// included.
    pub fn mark_read_command(&self, last_id: MessageId, unread: &[MessageId]) -> OutboundCommand {
        match self.thread_id {
            Some(chat_id) => OutboundCommand::MarkRead {
                chat_id: Some(chat_id),
                last_id: Some(last_id),
                ids: None,
            },
            None => OutboundCommand::MarkRead {
                chat_id: None,
                last_id: None,
                ids: Some(read_ids(last_id, unread)),
            },
        }
    }
}

/// `unread` up to `last_id`, ascending, with `last_id` itself.
pub(crate) fn read_ids(last_id: MessageId, unread: &[MessageId]) -> Vec<MessageId> {
    let mut ids: Vec<MessageId> = unread.iter().copied().filter(|id| *id <= last_id).collect();
    ids.push(last_id);
    ids.sort_unstable();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_requires_a_key() {
        assert!(ThreadContext::new(None, None, 1).is_err());
        assert!(ThreadContext::new(None, Some(String::new()), 1).is_err());
        assert!(ThreadContext::new(Some(3), None, 1).is_ok());
        assert!(ThreadContext::new(None, Some("bob".into()), 1).is_ok());
    }

    #[test]
    fn test_chat_id_wins_as_key() {
        let ctx = ThreadContext::new(Some(3), Some("bob".into()), 1).unwrap();
        assert_eq!(ctx.key(), ThreadKey::Chat(3));
        assert_eq!(ThreadContext::peer("bob", 1).key(), ThreadKey::Peer("bob".into()));
    }

    #[test]
    fn test_matches_by_chat_id() {
        let ctx = ThreadContext::chat(3, 1);
        assert!(ctx.matches(Some(3), None));
        assert!(ctx.matches(Some(3), Some("anyone")));
        assert!(!ctx.matches(Some(4), None));
        // A chat-addressed view ignores username-only events
        assert!(!ctx.matches(None, Some("bob")));
    }

    #[test]
    fn test_matches_by_peer() {
        let ctx = ThreadContext::peer("bob", 1);
        assert!(ctx.matches(None, Some("bob")));
        assert!(ctx.matches(Some(99), Some("bob")));
        assert!(!ctx.matches(None, Some("alice")));
        assert!(!ctx.matches(Some(99), None));
    }

    #[test]
    fn test_mark_read_command_shape() {
        let unread = [MessageId(7), MessageId(8)];
        let chat = ThreadContext::chat(3, 1).mark_read_command(MessageId(10), &unread);
        assert_eq!(
            chat,
            OutboundCommand::MarkRead { chat_id: Some(3), last_id: Some(MessageId(10)), ids: None }
        );

        let peer = ThreadContext::peer("bob", 1).mark_read_command(MessageId(10), &[]);
        assert_eq!(
            peer,
            OutboundCommand::MarkRead {
                chat_id: None,
                last_id: None,
                ids: Some(vec![MessageId(10)]),
            }
        );
    }

    #[test]
    fn test_peer_mark_read_lists_every_covered_id() {
        let unread = [MessageId(8), MessageId(7), MessageId(12)];
        let cmd = ThreadContext::peer("bob", 1).mark_read_command(MessageId(8), &unread);
        assert_eq!(
            cmd,
            OutboundCommand::MarkRead {
                chat_id: None,
                last_id: None,
                ids: Some(vec![MessageId(7), MessageId(8)]),
            }
        );
    }

    #[test]
    fn test_deserialize_runs_key_check() {
        let ok: ThreadContext = serde_json::from_str(
            r#"{"thread_id":3,"local_user_id":1,"initial_last_id":40}"#,
        )
        .unwrap();
        assert_eq!(ok.key(), ThreadKey::Chat(3));
        assert_eq!(ok.initial_last_id(), Some(MessageId(40)));

        let missing = serde_json::from_str::<ThreadContext>(r#"{"local_user_id":1}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(ThreadKey::Chat(5).to_string(), "chat:5");
        assert_eq!(ThreadKey::Peer("bob".into()).to_string(), "peer:bob");
    }
}

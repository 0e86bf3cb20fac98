//! Error taxonomy.
//!
//! Every failure is classified into one of four categories. Only
//! [`ErrorCategory::AuthorizationLost`] ever reaches the host as a
//! user-visible action (navigation); the rest are recovered locally.

use thiserror::Error;

use crate::http::{HttpError, SendError};
use crate::protocol::ProtocolError;

/// Configuration and identity errors, raised before anything connects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Thread context needs a chat id or a peer username")]
    MissingThreadKey,
    #[error("Push channel URL is empty")]
    EmptyPushUrl,
    #[error("Interval '{0}' must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Push channel dropped; reconnect + fallback poll.
    TransientConnection,
    /// A single request failed; retried on the next tick.
    TransientRequest,
    /// 403-class response; the view must navigate away.
    AuthorizationLost,
    /// Malformed payload; dropped with a diagnostic.
    PermanentLocal,
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Connection closed")]
    ConnectionClosed,
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Protocol(_) | Self::Config(_) => ErrorCategory::PermanentLocal,
            Self::Http(e) => e.category(),
            Self::Send(e) => e.category(),
            Self::WebSocket(_) | Self::ConnectionClosed => ErrorCategory::TransientConnection,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

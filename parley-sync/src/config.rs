//! Session configuration passed in by the hosting page.
//!
//! Durations are stored as milliseconds so the page can hand over a flat
//! JSON object; accessors convert to [`Duration`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::read_state::RetryPolicy;

/// HTTP endpoint templates.
///
/// `{chat_id}` and `{username}` are substituted per thread. Chat-addressed
/// threads use the `chat_*` templates, peer-addressed ones the `peer_*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// Prefix for every template, e.g. `https://example.org`
    pub base_url: String,
    pub chat_send: String,
    pub chat_poll: String,
    pub chat_header: String,
    pub chat_mark_read: String,
    pub peer_send: String,
    pub peer_poll: String,
    pub peer_mark_read: String,
    pub unread_count: String,
    /// Where to go when access is lost and the server gave no target
    pub inbox: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            chat_send: "/messages/chat/{chat_id}/send/".to_string(),
            chat_poll: "/messages/chat/{chat_id}/poll/".to_string(),
            chat_header: "/messages/chat/{chat_id}/header/".to_string(),
            chat_mark_read: "/messages/chat/{chat_id}/read/".to_string(),
            peer_send: "/messages/{username}/send/".to_string(),
            peer_poll: "/messages/{username}/poll/".to_string(),
            peer_mark_read: "/messages/{username}/read/".to_string(),
            unread_count: "/messages/unread-count/".to_string(),
            inbox: "/messages/".to_string(),
        }
    }
}

/// Everything tunable about a sync session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// WebSocket URL of the push channel
    pub push_url: String,
    pub endpoints: Endpoints,
    /// Delay before the single reconnect attempt after a close
    pub reconnect_delay_ms: u64,
    /// When set, the reconnect delay doubles per failure up to this cap
    pub reconnect_max_delay_ms: Option<u64>,
    /// How long `Connecting` may last before fallback polling starts
    pub connect_grace_ms: u64,
    pub thread_poll_interval_ms: u64,
    pub unread_poll_interval_ms: u64,
    pub mark_read_retry_interval_ms: u64,
    pub mark_read_retry_window_ms: u64,
    /// Pixels from the bottom that still count as "at bottom"
    pub scroll_threshold_px: f64,
    pub max_attachments: usize,
    pub bus_capacity: usize,
    /// Capacity of the effect channel handed to the host
    pub effect_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_url: "ws://127.0.0.1:8000/ws/notifications/".to_string(),
            endpoints: Endpoints::default(),
            reconnect_delay_ms: 2000,
            reconnect_max_delay_ms: None,
            connect_grace_ms: 3000,
            thread_poll_interval_ms: 2500,
            unread_poll_interval_ms: 2000,
            mark_read_retry_interval_ms: 250,
            mark_read_retry_window_ms: 6000,
            scroll_threshold_px: 4.0,
            max_attachments: 10,
            bus_capacity: 256,
            effect_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Parse configuration handed over by the page. Missing keys fall
    /// back to defaults; the result is validated.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.push_url.trim().is_empty() {
            return Err(ConfigError::EmptyPushUrl);
        }
        let intervals = [
            ("reconnect_delay_ms", self.reconnect_delay_ms),
            ("thread_poll_interval_ms", self.thread_poll_interval_ms),
            ("unread_poll_interval_ms", self.unread_poll_interval_ms),
            ("mark_read_retry_interval_ms", self.mark_read_retry_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if let Some(cap) = self.reconnect_max_delay_ms {
            if cap < self.reconnect_delay_ms {
                return Err(ConfigError::Invalid(format!(
                    "reconnect_max_delay_ms ({cap}) is below reconnect_delay_ms ({})",
                    self.reconnect_delay_ms
                )));
            }
        }
        if !self.scroll_threshold_px.is_finite() || self.scroll_threshold_px < 0.0 {
            return Err(ConfigError::Invalid("scroll_threshold_px must be >= 0".into()));
        }
        if self.bus_capacity == 0 || self.effect_capacity == 0 {
            return Err(ConfigError::Invalid("channel capacities must be > 0".into()));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Option<Duration> {
        self.reconnect_max_delay_ms.map(Duration::from_millis)
    }

    pub fn connect_grace(&self) -> Duration {
        Duration::from_millis(self.connect_grace_ms)
    }

    pub fn thread_poll_interval(&self) -> Duration {
        Duration::from_millis(self.thread_poll_interval_ms)
    }

    pub fn unread_poll_interval(&self) -> Duration {
        Duration::from_millis(self.unread_poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.mark_read_retry_interval_ms),
            Duration::from_millis(self.mark_read_retry_window_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.thread_poll_interval(), Duration::from_millis(2500));
        assert_eq!(config.unread_poll_interval(), Duration::from_secs(2));
        assert_eq!(config.connect_grace(), Duration::from_secs(3));
        assert_eq!(config.retry_policy().max_attempts, 24);
        assert_eq!(config.max_attachments, 10);
    }

    #[test]
    fn test_from_json_partial() {
        let config = SyncConfig::from_json(concat!(
            r#"{"push_url":"wss://chat.example/ws/","#,
            r#""endpoints":{"base_url":"https://chat.example"}}"#,
        ))
        .unwrap();
        assert_eq!(config.push_url, "wss://chat.example/ws/");
        assert_eq!(config.endpoints.base_url, "https://chat.example");
        // Untouched keys keep their defaults
        assert_eq!(config.endpoints.unread_count, "/messages/unread-count/");
        assert_eq!(config.reconnect_delay_ms, 2000);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = SyncConfig::from_json(r#"{"thread_poll_interval_ms":0}"#).unwrap_err();
        assert_eq!(err, ConfigError::ZeroInterval("thread_poll_interval_ms"));
    }

    #[test]
    fn test_rejects_empty_push_url() {
        let config = SyncConfig {
            push_url: "  ".into(),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::EmptyPushUrl));
    }

    #[test]
    fn test_rejects_backoff_cap_below_delay() {
        let config = SyncConfig {
            reconnect_max_delay_ms: Some(100),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(SyncConfig::from_json("{"), Err(ConfigError::Invalid(_))));
    }
}

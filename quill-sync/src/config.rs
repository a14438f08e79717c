//! Session configuration.

use std::time::Duration;

use crate::transport::ReconnectPolicy;

/// Language identifier meaning "nothing chosen yet". Never written into a
/// document as an initial language.
pub const GENERIC_LANGUAGE: &str = "plaintext";

/// Configuration for one editing session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on waiting for CRDT sync to deliver content when the room
    /// is already occupied.
    pub reconcile_wait: Duration,
    /// Interval between content checks during that wait.
    pub reconcile_poll: Duration,
    /// Time allowed between connecting and receiving `Welcome`.
    pub handshake_timeout: Duration,
    /// Language the local editor is configured with.
    pub editor_language: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconcile_wait: Duration::from_secs(2),
            reconcile_poll: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(5),
            editor_language: GENERIC_LANGUAGE.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_editor_language(mut self, language: impl Into<String>) -> Self {
        self.editor_language = language.into();
        self
    }

    /// Whether the editor language is worth writing into an empty document.
    pub fn editor_language_is_specific(&self) -> bool {
        let language = self.editor_language.trim();
        !language.is_empty() && language != GENERIC_LANGUAGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.reconcile_wait, Duration::from_secs(2));
        assert_eq!(config.reconcile_poll, Duration::from_millis(100));
        assert_eq!(config.editor_language, GENERIC_LANGUAGE);
        assert!(!config.editor_language_is_specific());
    }

    #[test]
    fn test_editor_language_specific() {
        assert!(SessionConfig::default().with_editor_language("rust").editor_language_is_specific());
        assert!(!SessionConfig::default().with_editor_language("  ").editor_language_is_specific());
    }
}

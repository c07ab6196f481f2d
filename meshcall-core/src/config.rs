//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid JSON for this structure
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Call client configuration
///
/// Every field has a default, so a config file only needs the values it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seconds an outgoing call rings before it is ended as missed
    /// (`None` leaves it to the server)
    pub ringing_timeout_secs: Option<u64>,
    /// Remote ICE candidates held per link until a remote description arrives
    pub max_pending_ice_candidates: usize,
    /// Capacity of the call event broadcast channel
    pub event_channel_capacity: usize,
    /// STUN/TURN URLs for native peer links
    pub ice_servers: Vec<String>,
    /// WebSocket relay URL
    pub signaling_url: Option<String>,
    /// Where accepted sessions are persisted for rejoin
    pub session_store_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ringing_timeout_secs: None,
            max_pending_ice_candidates: 64,
            event_channel_capacity: 100,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            signaling_url: None,
            session_store_path: None,
        }
    }
}

impl ClientConfig {
    /// Load and validate a JSON config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_json_str(&text)?;
        tracing::debug!(path = %path.as_ref().display(), "Loaded client configuration");
        Ok(config)
    }

    /// Parse and validate a JSON config
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or a value is invalid
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ringing_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "ringing_timeout_secs must be positive".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_channel_capacity must be positive".to_string(),
            ));
        }
        if self.max_pending_ice_candidates == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_ice_candidates must be positive".to_string(),
            ));
        }
        if let Some(url) = &self.signaling_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::Invalid(format!(
                    "signaling_url must be a ws:// or wss:// URL, got {}",
                    url
                )));
            }
        }
        if let Some(bad) = self
            .ice_servers
            .iter()
            .find(|u| !(u.starts_with("stun:") || u.starts_with("turn:") || u.starts_with("turns:")))
        {
            return Err(ConfigError::Invalid(format!("unsupported ICE server URL {}", bad)));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_pending_ice_candidates, 64);
        assert_eq!(config.event_channel_capacity, 100);
        assert_eq!(config.ringing_timeout_secs, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ClientConfig::from_json_str(r#"{"ringing_timeout_secs": 45}"#).unwrap();
        assert_eq!(config.ringing_timeout_secs, Some(45));
        assert_eq!(config.max_pending_ice_candidates, 64);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            ClientConfig::from_json_str(r#"{"ringing_timeout_secs": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ClientConfig::from_json_str(r#"{"signaling_url": "http://relay"}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ClientConfig::from_json_str(r#"{"ice_servers": ["http://x"]}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ClientConfig::from_json_str("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshcall.json");
        tokio::fs::write(&path, r#"{"signaling_url": "ws://127.0.0.1:9000"}"#)
            .await
            .unwrap();

        let config = ClientConfig::from_file(&path).await.unwrap();
        assert_eq!(config.signaling_url.as_deref(), Some("ws://127.0.0.1:9000"));
    }
}

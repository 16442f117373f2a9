//! Call manager configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::IceServer;

/// Public STUN servers used when nothing is configured
pub const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Call manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Local user id, sent as `from` in call requests
    pub user_id: String,

    /// Local display name, sent as `name` in call requests
    pub display_name: String,

    /// STUN/TURN endpoints handed to every peer transport
    pub ice_servers: Vec<IceServer>,

    /// Time a call may ring (or be accepting) before it is given up
    pub ringing_timeout: Duration,

    /// Time allowed between entering Negotiating and media connectivity
    pub negotiation_timeout: Duration,

    /// Period of the duration clock
    pub duration_tick: Duration,

    /// How long a disconnected transport may try to recover (zero = fail at once)
    pub disconnect_grace: Duration,

    /// Capacity of the broadcast event channel
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            display_name: String::new(),
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|url| IceServer::stun(*url)).collect(),
            ringing_timeout: Duration::from_secs(30),
            negotiation_timeout: Duration::from_secs(30),
            duration_tick: Duration::from_secs(1),
            disconnect_grace: Duration::ZERO,
            event_capacity: 64,
        }
    }
}

impl CallConfig {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Option<Self> {
        let user_id = std::env::var("CALL_USER_ID").ok()?;
        let display_name = std::env::var("CALL_DISPLAY_NAME").unwrap_or_else(|_| user_id.clone());
        let defaults = Self::default();

        let ice_servers = std::env::var("CALL_ICE_SERVERS")
            .ok()
            .map(|urls| {
                urls.split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(IceServer::stun)
                    .collect::<Vec<_>>()
            })
            .filter(|servers| !servers.is_empty())
            .unwrap_or(defaults.ice_servers);

        Some(Self {
            user_id,
            display_name,
            ice_servers,
            ringing_timeout: std::env::var("CALL_RINGING_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.ringing_timeout),
            negotiation_timeout: std::env::var("CALL_NEGOTIATION_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.negotiation_timeout),
            duration_tick: defaults.duration_tick,
            disconnect_grace: std::env::var("CALL_DISCONNECT_GRACE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.disconnect_grace),
            event_capacity: defaults.event_capacity,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.user_id.is_empty() {
            return Err("Local user id is required".to_string());
        }
        if self.display_name.is_empty() {
            return Err("Display name is required".to_string());
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err("ICE server without URLs".to_string());
            }
            for url in &server.urls {
                if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")) {
                    return Err(format!("ICE server URL needs a stun:/turn: scheme: {}", url));
                }
            }
            if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
                return Err("TURN servers require username and credential".to_string());
            }
        }
        if self.ringing_timeout.is_zero() {
            return Err("Ringing timeout must be non-zero".to_string());
        }
        if self.negotiation_timeout.is_zero() {
            return Err("Negotiation timeout must be non-zero".to_string());
        }
        if self.duration_tick.is_zero() {
            return Err("Duration tick must be non-zero".to_string());
        }
        if self.event_capacity == 0 {
            return Err("Event capacity must be non-zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CallConfig::new("u1", "Alice");
        assert_eq!(config.ringing_timeout, Duration::from_secs(30));
        assert_eq!(config.negotiation_timeout, Duration::from_secs(30));
        assert_eq!(config.duration_tick, Duration::from_secs(1));
        assert_eq!(config.ice_servers.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        assert!(CallConfig::default().validate().is_err());

        let mut config = CallConfig::new("u1", "Alice");
        config.ice_servers = vec![IceServer::stun("stun.example.org:3478")];
        assert!(config.validate().unwrap_err().contains("scheme"));

        let mut config = CallConfig::new("u1", "Alice");
        config.ice_servers = vec![IceServer::stun("turn:turn.example.org:3478")];
        assert!(config.validate().unwrap_err().contains("TURN"));

        let mut config = CallConfig::new("u1", "Alice");
        config.negotiation_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = CallConfig::new("u1", "Alice");
        config.ringing_timeout = Duration::ZERO;
        assert!(config.validate().unwrap_err().contains("Ringing"));
    }
}

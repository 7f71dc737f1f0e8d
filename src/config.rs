// Client configuration.
// Logging is compiled in for debug builds only; runtime knobs live in `ClientConfig`.

use crate::error::ConfigError;
use crate::peer::state::GRACE_PERIOD;
use crate::peer::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

#[cfg(debug_assertions)]
pub mod dev {
    // Flip to false to silence the client entirely in a debug build.
    // Has no effect in release builds.
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Environment variable that overrides `ClientConfig::relay_url`.
pub const RELAY_URL_ENV: &str = "ONVIA_RELAY_URL";

/// Google STUN pair used when the user has not configured ICE servers.
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Exponential backoff applied by the signaling channel between reconnect attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectPolicy {
    #[serde(with = "millis")]
    pub initial_interval: Duration,
    #[serde(with = "millis")]
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Randomization factor in `[0, 1)`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub relay_url: String,
    pub ice_servers: Vec<ServerConfig>,
    /// Upper bound on the camera/microphone permission prompt.
    #[serde(with = "millis")]
    pub acquire_timeout: Duration,
    /// A session that has not seen a remote track by then fails.
    #[serde(with = "millis")]
    pub negotiation_timeout: Duration,
    /// How long a connected transport may sit in `disconnected` before the session ends.
    #[serde(with = "millis")]
    pub grace_period: Duration,
    pub reconnect: ReconnectPolicy,
    /// Re-enter the matchmaking queue after a transport failure.
    pub requeue_on_failure: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080/ws".into(),
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            acquire_timeout: Duration::from_secs(30),
            negotiation_timeout: Duration::from_secs(30),
            grace_period: GRACE_PERIOD,
            reconnect: ReconnectPolicy::default(),
            requeue_on_failure: true,
        }
    }
}

impl ClientConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let mut config: ClientConfig = serde_json::from_str(text)?;
        if let Ok(url) = std::env::var(RELAY_URL_ENV) {
            config.relay_url = url;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        url::Url::parse(&self.relay_url)
            .map_err(|e| ConfigError::InvalidRelayUrl(format!("{}: {e}", self.relay_url)))?;
        self.ice_servers = validate_ice_servers(std::mem::take(&mut self.ice_servers))?;
        if self.reconnect.initial_interval.is_zero() {
            return Err(ConfigError::InvalidReconnect("initial interval must be positive"));
        }
        if self.reconnect.max_interval < self.reconnect.initial_interval {
            return Err(ConfigError::InvalidReconnect("max interval below initial interval"));
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter) {
            return Err(ConfigError::InvalidReconnect("jitter must be in [0, 1)"));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidReconnect("multiplier must be >= 1"));
        }
        Ok(())
    }
}

/// Checks a user-supplied ICE server list and normalizes URL schemes.
pub fn validate_ice_servers(servers: Vec<ServerConfig>) -> Result<Vec<ServerConfig>, ConfigError> {
    servers
        .into_iter()
        .map(|mut server| {
            if server.url.trim().is_empty() {
                return Err(ConfigError::InvalidIceServer {
                    id: server.id,
                    reason: "server URL cannot be empty",
                });
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::InvalidIceServer {
                    id: server.id,
                    reason: "TURN servers require username and credential",
                });
            }
            server.url = add_ice_url_scheme(&server);
            Ok(server)
        })
        .collect()
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = ClientConfig::from_json(
            r#"{ "relay_url": "wss://relay.example/ws", "negotiation_timeout": 1500 }"#,
        )
        .unwrap();
        if std::env::var(RELAY_URL_ENV).is_err() {
            assert_eq!(config.relay_url, "wss://relay.example/ws");
        }
        assert_eq!(config.negotiation_timeout, Duration::from_millis(1500));
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.requeue_on_failure);
    }

    #[test]
    fn zero_reconnect_interval_is_rejected() {
        let err = ClientConfig::from_json(
            r#"{ "reconnect": { "initial_interval": 0, "max_interval": 1000, "multiplier": 2.0, "jitter": 0.0 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReconnect(_)));
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let err = validate_ice_servers(vec![ServerConfig {
            id: "t".into(),
            r#type: "turn".into(),
            url: "turn.example:3478".into(),
            username: Some("u".into()),
            credential: None,
        }])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIceServer { .. }));
    }

    #[test]
    fn ice_urls_get_a_scheme() {
        let servers = validate_ice_servers(vec![ServerConfig {
            id: "s".into(),
            r#type: "stun".into(),
            url: "stun.example:3478".into(),
            username: None,
            credential: None,
        }])
        .unwrap();
        assert_eq!(servers[0].url, "stun:stun.example:3478");
    }

    #[test]
    fn bad_jitter_is_rejected() {
        let mut config = ClientConfig::default();
        config.reconnect.jitter = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidReconnect(_))
        ));
    }
}

//! Konfiguration über Umgebungsvariablen
//!
//! | Variable | Default |
//! |---|---|
//! | `SIGNALING_URL` | `ws://ws-voicertc-production.up.railway.app` |
//! | `CALL_DISPLAY_NAME` | `User-` + erste 4 Zeichen der Client-ID |
//! | `NEGOTIATION_TIMEOUT_SECS` | 30 |
//! | `RELAY_CONNECT_ATTEMPTS` | 5 |
//! | `STUN_SERVERS` | Google STUN (kommagetrennt) |
//! | `TURN_URL`, `TURN_USERNAME`, `TURN_CREDENTIAL` | kein TURN-Server |

use crate::call_engine::{default_stun_servers, EngineConfig, RtcMediaEngine};
use crate::signaling::RetryPolicy;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_SIGNALING_URL: &str = "ws://ws-voicertc-production.up.railway.app";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid signaling URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("TURN_URL requires TURN_USERNAME and TURN_CREDENTIAL")]
    IncompleteTurn,
}

/// Optionaler TURN-Server für Verbindungen hinter symmetrischem NAT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub signaling_url: String,
    pub display_name: Option<String>,
    pub negotiation_timeout: Duration,
    pub relay_connect_attempts: u32,
    pub stun_servers: Vec<String>,
    pub turn_server: Option<TurnServer>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            display_name: None,
            negotiation_timeout: EngineConfig::default().negotiation_timeout,
            relay_connect_attempts: RetryPolicy::default().max_attempts,
            stun_servers: default_stun_servers(),
            turn_server: None,
        }
    }
}

impl AppConfig {
    /// Liest die Konfiguration aus der Prozessumgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Liest die Konfiguration über eine beliebige Lookup-Funktion
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let signaling_url = get("SIGNALING_URL").unwrap_or(defaults.signaling_url);
        validate_url(&signaling_url)?;

        let negotiation_timeout = match get("NEGOTIATION_TIMEOUT_SECS") {
            Some(value) => Duration::from_secs(positive("NEGOTIATION_TIMEOUT_SECS", value)?),
            None => defaults.negotiation_timeout,
        };

        let relay_connect_attempts = match get("RELAY_CONNECT_ATTEMPTS") {
            Some(value) => {
                let attempts = positive("RELAY_CONNECT_ATTEMPTS", value.clone())?;
                u32::try_from(attempts).map_err(|_| ConfigError::InvalidNumber {
                    name: "RELAY_CONNECT_ATTEMPTS",
                    value,
                })?
            }
            None => defaults.relay_connect_attempts,
        };

        let stun_servers = match get("STUN_SERVERS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.stun_servers,
        };

        let turn_server = match get("TURN_URL") {
            Some(url) => match (get("TURN_USERNAME"), get("TURN_CREDENTIAL")) {
                (Some(username), Some(credential)) => Some(TurnServer {
                    url,
                    username,
                    credential,
                }),
                _ => return Err(ConfigError::IncompleteTurn),
            },
            None => None,
        };

        Ok(Self {
            signaling_url,
            display_name: get("CALL_DISPLAY_NAME"),
            negotiation_timeout,
            relay_connect_attempts,
            stun_servers,
            turn_server,
        })
    }

    /// WebRTC Media-Engine mit den konfigurierten ICE-Servern
    pub fn media_engine(&self) -> RtcMediaEngine {
        let engine = RtcMediaEngine::new(&self.stun_servers);
        match &self.turn_server {
            Some(turn) => engine.with_turn_server(
                turn.url.clone(),
                turn.username.clone(),
                turn.credential.clone(),
            ),
            None => engine,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            negotiation_timeout: self.negotiation_timeout,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.relay_connect_attempts)
    }
}

fn validate_url(raw: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" | "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}

fn positive(name: &'static str, value: String) -> Result<u64, ConfigError> {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber { name, value }),
    }
}

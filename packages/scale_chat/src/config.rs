use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Equivalent ways to configure:
//
//   config.toml:     [distribution]
//                    enabled = true
//
//   env var:         SCALE_CHAT_DISTRIBUTION__ENABLED=true   (double underscore = nesting)
//
//   legacy env var:  ENABLE_DIST=true
//
// CLI flags (--host, --port, --metrics-port) are applied last by the binary.

/// Environment variable prefix for sectioned settings.
pub const ENV_PREFIX: &str = "SCALE_CHAT_";

/// Unprefixed variables kept for compatibility with existing deployments,
/// and the config key each one maps to.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("DIST_SERVER", "distribution.server"),
    ("DIST_SERVER_PASSWORD", "distribution.password"),
    ("DIST_TOPIC", "distribution.topic"),
];

/// Legacy on/off switch for distribution. Values follow the boolean
/// spellings existing deployments already use (`1`, `t`, `TRUE`, ...).
const LEGACY_ENABLE_ENV: &str = "ENABLE_DIST";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub distribution: DistributionFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            metrics_port: default_metrics_port(),
        }
    }
}

/// Queue sizing (lives under `[relay]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_queue_capacity")]
    pub inbound_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub outbound_capacity: usize,
    /// 0 keeps every message for the life of the process.
    #[serde(default)]
    pub history_limit: usize,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: default_queue_capacity(),
            outbound_capacity: default_queue_capacity(),
            history_limit: 0,
        }
    }
}

/// Backbone settings (lives under `[distribution]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DistributionFileConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `host:port` or a `redis://` URL.
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default = "default_connect_retry_secs")]
    pub connect_retry_secs: u64,
    /// Identity stamped on every publish. Generated when absent.
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for DistributionFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server: String::new(),
            password: String::new(),
            topic: String::new(),
            connect_retry_secs: default_connect_retry_secs(),
            instance_id: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    8081
}
fn default_queue_capacity() -> usize {
    100
}
fn default_connect_retry_secs() -> u64 {
    3
}

/// Build a figment that layers: defaults → config file → SCALE_CHAT_* env vars → legacy env vars.
///
/// A missing config file is not an error.
///
/// Env vars use double-underscore for nesting into sections:
///   `SCALE_CHAT_RELAY__HISTORY_LIMIT=500`  →  `relay.history_limit = 500`
///   `SCALE_CHAT_SERVER__PORT=9000`         →  `server.port = 9000`
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    let legacy = Env::raw()
        .only(&LEGACY_ENV.iter().map(|(var, _)| *var).collect::<Vec<_>>())
        .map(|var| {
            LEGACY_ENV
                .iter()
                .find(|(name, _)| var.as_str().eq_ignore_ascii_case(name))
                .map(|(_, key)| *key)
                .unwrap_or("distribution.unknown")
                .into()
        });

    figment = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .merge(legacy);

    // Unrecognised spellings pass through as strings so extraction reports them.
    for (_, value) in Env::raw().only(&[LEGACY_ENABLE_ENV]).iter() {
        figment = match parse_legacy_bool(&value) {
            Some(enabled) => figment.merge(Serialized::default("distribution.enabled", enabled)),
            None => figment.merge(Serialized::default("distribution.enabled", value)),
        };
    }
    figment
}

/// `1 t T TRUE true True` and `0 f F FALSE false False`.
fn parse_legacy_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Resolved server configuration.
#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// Client WebSocket listener
    pub chat_addr: SocketAddr,
    /// Internal listener for /metrics and /health
    pub internal_addr: SocketAddr,
    pub relay: RelayConfig,
    /// None when distribution is disabled
    pub distribution: Option<DistributionConfig>,
    /// This instance's identity on the backbone and in health reports.
    pub server_id: String,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub history_limit: usize,
}

#[derive(Clone, Debug)]
pub struct DistributionConfig {
    pub server: String,
    pub password: String,
    pub topic: String,
    /// Delay before the single connect retry
    pub connect_retry: Duration,
}

impl ChatConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let chat_addr = socket_addr(&fc.server.host, fc.server.port)?;
        let internal_addr = socket_addr(&fc.server.host, fc.server.metrics_port)?;

        Ok(Self {
            chat_addr,
            internal_addr,
            relay: RelayConfig::from_file(&fc.relay)?,
            distribution: DistributionConfig::from_file(&fc.distribution)?,
            server_id: fc
                .distribution
                .instance_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        })
    }

    /// Loopback listeners on ephemeral ports, distribution off.
    pub fn ephemeral() -> Self {
        Self {
            chat_addr: ([127, 0, 0, 1], 0).into(),
            internal_addr: ([127, 0, 0, 1], 0).into(),
            relay: RelayConfig {
                inbound_capacity: default_queue_capacity(),
                outbound_capacity: default_queue_capacity(),
                history_limit: 0,
            },
            distribution: None,
            server_id: Uuid::new_v4().to_string(),
        }
    }
}

impl RelayConfig {
    pub fn from_file(fc: &RelayFileConfig) -> Result<Self> {
        if fc.inbound_capacity == 0 {
            bail!("relay.inbound_capacity must be greater than zero");
        }
        if fc.outbound_capacity == 0 {
            bail!("relay.outbound_capacity must be greater than zero");
        }
        Ok(Self {
            inbound_capacity: fc.inbound_capacity,
            outbound_capacity: fc.outbound_capacity,
            history_limit: fc.history_limit,
        })
    }
}

impl DistributionConfig {
    pub fn from_file(fc: &DistributionFileConfig) -> Result<Option<Self>> {
        if !fc.enabled {
            return Ok(None);
        }
        if fc.server.trim().is_empty() {
            bail!("distribution is enabled but distribution.server (DIST_SERVER) is not set");
        }
        if fc.topic.trim().is_empty() {
            bail!("distribution is enabled but distribution.topic (DIST_TOPIC) is not set");
        }
        Ok(Some(Self {
            server: fc.server.clone(),
            password: fc.password.clone(),
            topic: fc.topic.clone(),
            connect_retry: Duration::from_secs(fc.connect_retry_secs),
        }))
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let ip: std::net::IpAddr = match host {
        "localhost" => [127, 0, 0, 1].into(),
        other => other
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.host '{other}': {e}"))?,
    };
    Ok(SocketAddr::new(ip, port))
}

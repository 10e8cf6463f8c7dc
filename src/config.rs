use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::hub::{HubConfig, OverflowPolicy};
use crate::packet::Marshaler;

/// linehub connection hub server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "linehub", version, about = "Real-time connection hub server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "LINEHUB_PORT", default_value = "8320")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "LINEHUB_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./linehub.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "LINEHUB_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (signing keys)
    #[arg(long, env = "LINEHUB_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Hub tuning (loaded from [hub] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub hub: Option<HubTuning>,

    /// Frame protocol settings (loaded from [protocol] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub protocol: Option<ProtocolSettings>,
}

/// Tuning knobs for the connection hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubTuning {
    /// Idle-sweep tick in seconds (floored at 1 by the hub)
    #[serde(default = "default_live_check_secs")]
    pub live_check_interval_secs: u64,

    /// Lines inactive longer than this are evicted (seconds)
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,

    /// Per-iteration read deadline on a WebSocket line (seconds)
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Deadline for one outbound socket write (seconds)
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Keep-alive comment interval on SSE lines (seconds)
    #[serde(default = "default_sse_heartbeat_secs")]
    pub sse_heartbeat_secs: u64,

    /// Capacity of each line's outbound write channel
    #[serde(default = "default_write_channel_capacity")]
    pub write_channel_capacity: usize,

    /// Capacity of the external event channels
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Overflow policy when a line's write channel is full:
    /// "block" or "drop-newest"
    #[serde(default = "default_overflow")]
    pub overflow: String,

    /// How long a blocking push waits for channel space (milliseconds)
    #[serde(default = "default_push_block_timeout_ms")]
    pub push_block_timeout_ms: u64,

    /// Task pool capacity (caps total hub concurrency)
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// WebSocket subprotocols offered during the upgrade
    #[serde(default)]
    pub subprotocols: Vec<String>,

    /// Allowed Origin header values for WebSocket upgrades.
    /// Empty list means any origin is accepted.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for HubTuning {
    fn default() -> Self {
        Self {
            live_check_interval_secs: default_live_check_secs(),
            max_idle_secs: default_max_idle_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            sse_heartbeat_secs: default_sse_heartbeat_secs(),
            write_channel_capacity: default_write_channel_capacity(),
            event_channel_capacity: default_event_channel_capacity(),
            overflow: default_overflow(),
            push_block_timeout_ms: default_push_block_timeout_ms(),
            pool_capacity: default_pool_capacity(),
            subprotocols: Vec::new(),
            allowed_origins: Vec::new(),
        }
    }
}

impl HubTuning {
    /// Translate the flat TOML knobs into the hub's config struct.
    pub fn to_hub_config(&self) -> HubConfig {
        let overflow = match self.overflow.as_str() {
            "drop-newest" => OverflowPolicy::DropNewest,
            _ => OverflowPolicy::Block {
                timeout: Duration::from_millis(self.push_block_timeout_ms),
            },
        };

        let origin_check = if self.allowed_origins.is_empty() {
            None
        } else {
            let allowed = self.allowed_origins.clone();
            Some(Arc::new(move |headers: &axum::http::HeaderMap| {
                match headers.get("origin").and_then(|v| v.to_str().ok()) {
                    Some(origin) => allowed.iter().any(|a| a == origin),
                    None => false,
                }
            }) as Arc<dyn Fn(&axum::http::HeaderMap) -> bool + Send + Sync>)
        };

        HubConfig {
            subprotocols: self.subprotocols.clone(),
            live_check_interval: Duration::from_secs(self.live_check_interval_secs),
            max_idle: Duration::from_secs(self.max_idle_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            sse_heartbeat: Duration::from_secs(self.sse_heartbeat_secs),
            write_channel_capacity: self.write_channel_capacity,
            event_channel_capacity: self.event_channel_capacity,
            overflow,
            origin_check,
        }
    }
}

fn default_live_check_secs() -> u64 {
    30
}

fn default_max_idle_secs() -> u64 {
    300
}

fn default_read_timeout_secs() -> u64 {
    75
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_sse_heartbeat_secs() -> u64 {
    15
}

fn default_write_channel_capacity() -> usize {
    64
}

fn default_event_channel_capacity() -> usize {
    256
}

fn default_overflow() -> String {
    "block".to_string()
}

fn default_push_block_timeout_ms() -> u64 {
    5000
}

fn default_pool_capacity() -> usize {
    4096
}

/// Frame protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSettings {
    /// Payload marshaler: "messagepack" or "json"
    #[serde(default = "default_marshaler")]
    pub marshaler: String,

    /// Hex-encoded HMAC-SHA256 key for frame signing. Empty disables
    /// signing.
    #[serde(default)]
    pub hmac_key_hex: String,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            marshaler: default_marshaler(),
            hmac_key_hex: String::new(),
        }
    }
}

impl ProtocolSettings {
    pub fn marshaler(&self) -> Marshaler {
        Marshaler::from_str(&self.marshaler).unwrap_or(Marshaler::MessagePack)
    }
}

fn default_marshaler() -> String {
    "messagepack".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8320,
            bind_address: "0.0.0.0".to_string(),
            config: "./linehub.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            hub: Some(HubTuning::default()),
            protocol: Some(ProtocolSettings::default()),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (LINEHUB_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("LINEHUB_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# linehub Connection Hub Configuration
# Place this file at ./linehub.toml or specify with --config <path>
# All settings can be overridden via environment variables (LINEHUB_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8320)
# port = 8320

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the session signing key
# data_dir = "./data"

# ---- Hub Tuning ----
# [hub]

# Idle-sweep tick in seconds (floored at 1)
# live_check_interval_secs = 30

# Evict lines inactive longer than this (seconds)
# max_idle_secs = 300

# Per-iteration read deadline on a WebSocket line (seconds)
# read_timeout_secs = 75

# Deadline for one outbound socket write (seconds)
# write_timeout_secs = 10

# Keep-alive comment interval on SSE lines (seconds)
# sse_heartbeat_secs = 15

# Capacity of each line's outbound write channel
# write_channel_capacity = 64

# Capacity of the external event channels
# event_channel_capacity = 256

# Overflow policy when a line's write channel is full:
# "block" waits up to push_block_timeout_ms, "drop-newest" never waits
# overflow = "block"
# push_block_timeout_ms = 5000

# Task pool capacity — caps total hub concurrency
# pool_capacity = 4096

# WebSocket subprotocols offered during the upgrade
# subprotocols = []

# Allowed Origin header values for WebSocket upgrades (empty = any)
# allowed_origins = []

# ---- Frame Protocol ----
# [protocol]

# Payload marshaler: "messagepack" or "json"
# marshaler = "messagepack"

# Hex-encoded HMAC-SHA256 key for frame signing (empty disables signing)
# hmac_key_hex = ""
"#
    .to_string()
}

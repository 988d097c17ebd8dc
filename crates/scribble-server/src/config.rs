//! Server configuration.
//!
//! Sources, lowest precedence first:
//! - Built-in defaults (`SCRIBBLE_HOST` / `SCRIBBLE_PORT` seed host and port)
//! - The first TOML file found at `$SCRIBBLE_CONFIG`, `scribble.toml`,
//!   `/etc/scribble/scribble.toml` or `~/.config/scribble/scribble.toml`
//! - Environment variables `SCRIBBLE__<SECTION>__<KEY>`

use anyhow::{Context, Result};
use scribble_core::{BoardAcl, ManagerConfig, RegistryConfig, ReplayConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub replay: ReplaySettings,

    #[serde(default)]
    pub access: AccessConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of open sockets.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of boards with live connections.
    #[serde(default = "default_max_boards")]
    pub max_boards: usize,

    /// Maximum connections on one board.
    #[serde(default = "default_max_members")]
    pub max_members_per_board: usize,

    /// Maximum inbound WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Strokes buffered per connection before live events are dropped for it.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle connections are closed after this many milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Event log backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
}

/// Event log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Directory for the file backend; `~` is expanded.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Sync every append to disk.
    #[serde(default)]
    pub fsync: bool,
}

/// History replay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySettings {
    /// Events read from the log per page.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Longest wait for a slow joiner per replayed event, in milliseconds.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

/// Board access configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Whether boards without a participant list are open to everyone.
    #[serde(default = "default_true")]
    pub open: bool,

    /// Participant identities per restricted board.
    #[serde(default)]
    pub boards: HashMap<String, Vec<String>>,
}

// Default value functions
fn default_host() -> String {
    std::env::var("SCRIBBLE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("SCRIBBLE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_boards() -> usize {
    10_000
}

fn default_max_members() -> usize {
    1_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_queue() -> usize {
    4_096
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    90_000 // 90 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_backend() -> StorageBackend {
    StorageBackend::File
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_batch_size() -> usize {
    512
}

fn default_send_timeout() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            storage: StorageConfig::default(),
            replay: ReplaySettings::default(),
            access: AccessConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_boards: default_max_boards(),
            max_members_per_board: default_max_members(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
            fsync: false,
        }
    }
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            open: true,
            boards: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then apply
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("SCRIBBLE_CONFIG").ok();
        let candidates = explicit.iter().map(String::as_str).chain([
            "scribble.toml",
            "/etc/scribble/scribble.toml",
            "~/.config/scribble/scribble.toml",
        ]);

        let file = candidates
            .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
            .find(|p| p.exists());

        Self::build(file.as_deref())
    }

    /// Layer defaults, an optional TOML file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if any source fails to parse.
    pub fn build(file: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder().add_source(
            ::config::Config::try_from(&Config::default())
                .context("Failed to serialize default config")?,
        );

        if let Some(path) = file {
            tracing::info!("Loading config from {}", path.display());
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder
            .add_source(
                ::config::Environment::with_prefix("SCRIBBLE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render config")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form an address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Data directory with `~` expanded.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage.data_dir).into_owned())
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            registry: RegistryConfig {
                max_boards: self.limits.max_boards,
                max_members_per_board: self.limits.max_members_per_board,
            },
            replay: ReplayConfig {
                batch_size: self.replay.batch_size,
                send_timeout: Duration::from_millis(self.replay.send_timeout_ms),
            },
        }
    }

    /// Authorization gate described by `[access]`.
    #[must_use]
    pub fn acl(&self) -> BoardAcl {
        self.access
            .boards
            .iter()
            .fold(BoardAcl::new(self.access.open), |acl, (board, people)| {
                acl.with_board(board.clone(), people.iter().cloned())
            })
    }
}

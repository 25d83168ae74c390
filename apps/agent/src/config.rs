//! Agent configuration.
//!
//! Stored as TOML:
//! - Linux: `~/.config/fleetlink/agent.toml`
//! - Windows: `%APPDATA%/fleetlink/agent.toml`
//!
//! A missing file yields the defaults; every field has its own default so a
//! partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use fleetlink_control_plane::{ControlPlaneOptions, ReconnectPolicy};
use fleetlink_transfer::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT_TRANSFERS, DEFAULT_MAX_FILE_SIZE,
    DEFAULT_READ_TIMEOUT, FileTransferOptions,
};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Display name of this agent (hostname by default).
    #[serde(default = "default_name")]
    pub name: String,

    /// Node id assigned at enrollment.
    #[serde(default)]
    pub node_id: Option<Uuid>,

    /// Organisation the node is enrolled in.
    #[serde(default)]
    pub organization_id: Option<Uuid>,

    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    #[serde(default)]
    pub certificate: CertificateConfig,

    #[serde(default)]
    pub transfer: TransferConfig,
}

/// `[control_plane]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Base URL, `wss://` or `https://`.
    #[serde(default)]
    pub endpoint: String,

    /// Extra PEM roots trusted for the control plane.
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,

    #[serde(default = "default_server_timeout_secs")]
    pub server_timeout_secs: u64,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,

    /// Unlimited when absent.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_true")]
    pub telemetry_enabled: bool,

    #[serde(default = "default_telemetry_interval_secs")]
    pub telemetry_interval_secs: u64,
}

/// `[certificate]` section. Both paths are needed for client auth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertificateConfig {
    #[serde(default)]
    pub chain_path: Option<PathBuf>,

    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

/// `[transfer]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Base address of the file API. Must be https.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Directory transfers may read from and write to, besides the temp dir.
    #[serde(default)]
    pub server_base_path: Option<PathBuf>,

    /// Overrides the system temp dir.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// A download body that sends nothing for this long fails.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Fleetlink Agent".into())
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_call_timeout_secs() -> u64 {
    15
}

fn default_keep_alive_interval_secs() -> u64 {
    15
}

fn default_server_timeout_secs() -> u64 {
    60
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_secs() -> u64 {
    30
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_telemetry_interval_secs() -> u64 {
    60
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_max_concurrent_transfers() -> usize {
    DEFAULT_MAX_CONCURRENT_TRANSFERS
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_read_timeout_secs() -> u64 {
    DEFAULT_READ_TIMEOUT.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            node_id: None,
            organization_id: None,
            control_plane: ControlPlaneConfig::default(),
            certificate: CertificateConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            ca_bundle: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
            server_timeout_secs: default_server_timeout_secs(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
            max_reconnect_attempts: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            telemetry_enabled: default_true(),
            telemetry_interval_secs: default_telemetry_interval_secs(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            server_base_path: None,
            temp_dir: None,
            chunk_size: default_chunk_size(),
            max_file_size: default_max_file_size(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl Config {
    /// Loads from `path`, or from the platform config path when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path(),
        };

        if !path.exists() {
            tracing::info!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }
}

impl ControlPlaneConfig {
    pub fn options(&self) -> ControlPlaneOptions {
        ControlPlaneOptions {
            endpoint: self.endpoint.clone(),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            keep_alive_interval: Duration::from_secs(self.keep_alive_interval_secs),
            server_timeout: Duration::from_secs(self.server_timeout_secs),
            reconnect: self.reconnect_policy(),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_secs(self.reconnect_max_delay_secs),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs.max(1))
    }
}

impl TransferConfig {
    pub fn options(&self) -> FileTransferOptions {
        let defaults = FileTransferOptions::default();
        FileTransferOptions {
            chunk_size: self.chunk_size,
            max_file_size: self.max_file_size,
            max_concurrent_transfers: self.max_concurrent_transfers,
            read_timeout: self.read_timeout(),
            temp_dir: self.temp_dir.clone().unwrap_or(defaults.temp_dir),
            server_base_path: self.server_base_path.clone(),
        }
    }

    pub fn base_url(&self) -> anyhow::Result<Option<Url>> {
        self.base_url
            .as_deref()
            .map(|raw| Url::parse(raw).with_context(|| format!("invalid transfer base url {raw:?}")))
            .transpose()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Never zero: a zero timeout would fail every download.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("fleetlink")
            .join("agent.toml")
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("fleetlink").join("agent.toml")
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        PathBuf::from("/tmp/fleetlink/agent.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(!config.name.is_empty());
        assert!(config.node_id.is_none());
        assert_eq!(config.control_plane.heartbeat_interval_secs, 30);
        assert!(config.control_plane.telemetry_enabled);
        assert_eq!(config.transfer.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml_str = r#"
            name = "edge-7"
            node_id = "6f1c0d2e-8a4b-4c3d-9e5f-0a1b2c3d4e5f"

            [control_plane]
            endpoint = "wss://cp.example.com"
            max_reconnect_attempts = 5

            [transfer]
            server_base_path = "/srv/fleetlink"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.name, "edge-7");
        assert!(config.node_id.is_some());
        assert!(config.organization_id.is_none());
        assert_eq!(config.control_plane.endpoint, "wss://cp.example.com");
        assert_eq!(config.control_plane.call_timeout_secs, 15);
        assert_eq!(config.control_plane.max_reconnect_attempts, Some(5));
        assert_eq!(
            config.transfer.server_base_path.as_deref(),
            Some(Path::new("/srv/fleetlink"))
        );
        assert_eq!(config.transfer.max_concurrent_transfers, DEFAULT_MAX_CONCURRENT_TRANSFERS);
    }

    #[test]
    fn control_plane_options_conversion() {
        let section = ControlPlaneConfig {
            endpoint: "https://cp.example.com".into(),
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_secs: 10,
            call_timeout_secs: 5,
            ..ControlPlaneConfig::default()
        };
        let options = section.options();
        assert_eq!(options.endpoint, "https://cp.example.com");
        assert_eq!(options.call_timeout, Duration::from_secs(5));
        assert_eq!(options.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(options.reconnect.max_delay, Duration::from_secs(10));
        assert_eq!(options.max_reconnect_attempts, None);
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let section = ControlPlaneConfig {
            heartbeat_interval_secs: 0,
            telemetry_interval_secs: 0,
            ..ControlPlaneConfig::default()
        };
        assert_eq!(section.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(section.telemetry_interval(), Duration::from_secs(1));
    }

    #[test]
    fn transfer_options_conversion() {
        let section = TransferConfig {
            temp_dir: Some(PathBuf::from("/var/tmp/fleetlink")),
            max_file_size: 1024,
            ..TransferConfig::default()
        };
        let options = section.options();
        assert_eq!(options.temp_dir, PathBuf::from("/var/tmp/fleetlink"));
        assert_eq!(options.max_file_size, 1024);
        assert_eq!(options.read_timeout, DEFAULT_READ_TIMEOUT);

        let options = TransferConfig::default().options();
        assert_eq!(options.temp_dir, std::env::temp_dir());
    }

    #[test]
    fn transfer_read_timeout_from_toml() {
        let section: TransferConfig = toml::from_str("read_timeout_secs = 15").unwrap();
        assert_eq!(section.read_timeout(), Duration::from_secs(15));
        assert_eq!(section.options().read_timeout, Duration::from_secs(15));

        let zero: TransferConfig = toml::from_str("read_timeout_secs = 0").unwrap();
        assert_eq!(zero.read_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn transfer_base_url_is_parsed() {
        let section = TransferConfig {
            base_url: Some("https://cp.example.com/api".into()),
            ..TransferConfig::default()
        };
        assert_eq!(
            section.base_url().unwrap().unwrap().as_str(),
            "https://cp.example.com/api"
        );
        assert!(TransferConfig::default().base_url().unwrap().is_none());

        let bad = TransferConfig {
            base_url: Some("not a url".into()),
            ..TransferConfig::default()
        };
        assert!(bad.base_url().is_err());
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&tmp.path().join("absent.toml"))).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_reads_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.toml");
        std::fs::write(&path, "name = \"from-file\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.name, "from-file");
    }

    #[test]
    fn load_rejects_malformed_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.toml");
        std::fs::write(&path, "name = [").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn config_path_not_empty() {
        assert!(config_path().to_string_lossy().contains("fleetlink"));
    }
}

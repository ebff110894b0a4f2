//! # Configuration Management Module
//!
//! Station configuration for the SBD link, loaded from a TOML file.
//!
//! ## Configuration Structure
//!
//! - [`ModemConfig`] - Serial device discovery, locking and modem timing
//! - [`ExchangeConfig`] - Exchange cycle cadence and the inbound drop directory
//! - [`SourceConfig`] - One prioritized outbound spool (repeatable)
//! - [`InboundConfig`] - Dispatcher inbox, staging area and ack spool
//! - [`LoggingConfig`] - Log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sbdlink::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("sbdlink.toml").await?;
//!     config.validate()?;
//!     println!("Candidate modems: {:?}", config.modem.devices);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [modem]
//! devices = ["iridium", "ttyUSB0"]
//! device_dir = "/dev"
//! lock_dir = "/tmp"
//! baud_rate = 19200
//!
//! [exchange]
//! interval_secs = 300
//! inbound_dir = "spool/inbound"
//!
//! [[sources]]
//! name = "power"
//! code = 1
//! files = "spool/outbound/power-*.dat"
//! priority = 1
//! limit_files = 4
//!
//! [inbound]
//! inbox_dir = "spool/inbound"
//! staging_dir = "spool/staging"
//! output_root = "/"
//! ack_path = "spool/outbound/ack-%Y%m%d-%H%M%S.dat"
//! stale_transfer_hours = 24
//! ```

use crate::exchange::Source;
use crate::lockfile::LockPolicy;
use crate::modem::ModemSettings;
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub modem: ModemConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub inbound: InboundConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    /// Device names tried in order under `device_dir`; the first one present wins.
    pub devices: Vec<String>,
    #[serde(default = "default_device_dir")]
    pub device_dir: String,
    /// Directory holding the `LCK..<device>` lock files.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Serial read/write timeout.
    #[serde(default = "default_serial_timeout")]
    pub serial_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Signal bars required before a session is attempted (0-5).
    #[serde(default = "default_min_signal")]
    pub min_signal: u8,
    #[serde(default = "default_signal_timeout")]
    pub signal_timeout_secs: u64,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    /// Back-off after the gateway could not be reached.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
}

fn default_device_dir() -> String {
    "/dev".to_string()
}

fn default_lock_dir() -> String {
    "/tmp".to_string()
}

fn default_baud_rate() -> u32 {
    19200
}

fn default_serial_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    30
}

fn default_min_signal() -> u8 {
    2
}

fn default_signal_timeout() -> u64 {
    30
}

fn default_session_timeout() -> u64 {
    300
}

fn default_retry_delay() -> u64 {
    15
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lock_attempts() -> u32 {
    30
}

fn default_lock_retries() -> u32 {
    10
}

fn default_lock_wait_ms() -> u64 {
    1000
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            devices: vec!["iridium".to_string(), "ttyUSB0".to_string()],
            device_dir: default_device_dir(),
            lock_dir: default_lock_dir(),
            baud_rate: default_baud_rate(),
            serial_timeout_secs: default_serial_timeout(),
            command_timeout_secs: default_command_timeout(),
            min_signal: default_min_signal(),
            signal_timeout_secs: default_signal_timeout(),
            session_timeout_secs: default_session_timeout(),
            retry_delay_secs: default_retry_delay(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_attempts: default_lock_attempts(),
            lock_retries: default_lock_retries(),
            lock_wait_ms: default_lock_wait_ms(),
        }
    }
}

impl ModemConfig {
    pub fn settings(&self) -> ModemSettings {
        let lock_wait = Duration::from_millis(self.lock_wait_ms);
        ModemSettings {
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            min_signal: self.min_signal,
            signal_timeout: Duration::from_secs(self.signal_timeout_secs),
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            lock: LockPolicy {
                attempts: self.lock_attempts,
                busy_wait: lock_wait,
                max_retries: self.lock_retries,
                wait_interval: lock_wait,
            },
            ..ModemSettings::default()
        }
    }

    pub fn serial_timeout(&self) -> Duration {
        Duration::from_secs(self.serial_timeout_secs)
    }

    /// First configured device that exists, with its lock file path.
    pub fn find_device(&self) -> Option<(PathBuf, PathBuf)> {
        self.devices.iter().find_map(|name| {
            let device = Path::new(&self.device_dir).join(name);
            log::info!("  - {}", name);
            device
                .exists()
                .then(|| (device, Path::new(&self.lock_dir).join(format!("LCK..{}", name))))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange_interval")]
    pub interval_secs: u64,
    /// Where received MT messages are dropped for the inbound dispatcher.
    #[serde(default = "default_inbound_dir")]
    pub inbound_dir: String,
}

fn default_exchange_interval() -> u64 {
    300
}

fn default_inbound_dir() -> String {
    "spool/inbound".to_string()
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_exchange_interval(),
            inbound_dir: default_inbound_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Origin code prefixed to each outbound payload.
    pub code: u8,
    /// Glob selecting this source's spooled files.
    pub files: String,
    /// Lower values are sent first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_files: Option<usize>,
}

impl SourceConfig {
    pub fn to_source(&self) -> Result<Source> {
        Source::new(
            self.name.clone(),
            self.code,
            self.files.clone(),
            self.priority,
            self.limit_files,
        )
        .map_err(|e| anyhow!("Invalid file pattern for source {}: {}", self.name, e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    #[serde(default = "default_inbound_dir")]
    pub inbox_dir: String,
    /// File parts awaiting the rest of their transfer.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    /// Base for relative destination filenames.
    #[serde(default = "default_output_root")]
    pub output_root: String,
    /// strftime pattern for acknowledgment files.
    #[serde(default = "default_ack_path")]
    pub ack_path: String,
    #[serde(default = "default_inbound_poll")]
    pub poll_interval_secs: u64,
    /// Staged transfers untouched for this long are swept.
    #[serde(default = "default_stale_transfer_hours")]
    pub stale_transfer_hours: u64,
}

impl InboundConfig {
    pub fn stale_transfer_age(&self) -> Duration {
        Duration::from_secs(self.stale_transfer_hours * 3600)
    }
}

fn default_staging_dir() -> String {
    "spool/staging".to_string()
}

fn default_output_root() -> String {
    "/".to_string()
}

fn default_ack_path() -> String {
    "spool/outbound/ack-%Y%m%d-%H%M%S.dat".to_string()
}

fn default_inbound_poll() -> u64 {
    10
}

fn default_stale_transfer_hours() -> u64 {
    24
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            inbox_dir: default_inbound_dir(),
            staging_dir: default_staging_dir(),
            output_root: default_output_root(),
            ack_path: default_ack_path(),
            poll_interval_secs: default_inbound_poll(),
            stale_transfer_hours: default_stale_transfer_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.modem.devices.is_empty() {
            bail!("modem.devices must list at least one device name");
        }
        if self.modem.min_signal > 5 {
            bail!("modem.min_signal must be 0-5, got {}", self.modem.min_signal);
        }

        let mut names = HashSet::new();
        let mut codes = HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                bail!("duplicate source name '{}'", source.name);
            }
            if !codes.insert(source.code) {
                bail!("duplicate source code {} ({})", source.code, source.name);
            }
            source.to_source()?;
        }
        Ok(())
    }

    pub fn sources(&self) -> Result<Vec<Source>> {
        self.sources.iter().map(SourceConfig::to_source).collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            modem: ModemConfig::default(),
            exchange: ExchangeConfig::default(),
            sources: vec![
                SourceConfig {
                    name: "ack".to_string(),
                    code: 0,
                    files: "spool/outbound/ack-*.dat".to_string(),
                    priority: 0,
                    limit_files: None,
                },
                SourceConfig {
                    name: "system".to_string(),
                    code: 1,
                    files: "spool/outbound/system-*.dat".to_string(),
                    priority: 1,
                    limit_files: Some(4),
                },
            ],
            inbound: InboundConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

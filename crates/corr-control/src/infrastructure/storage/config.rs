//! TOML-based configuration for the correlator control plane.
//!
//! The default file lives in the platform config directory:
//! - Windows:  `%APPDATA%\CorrControl\config.toml`
//! - Linux:    `~/.config/corr-control/config.toml`
//! - macOS:    `~/Library/Application Support/CorrControl/config.toml`
//!
//! # Example
//!
//! ```toml
//! [control]
//! request_timeout_ms = 5000
//!
//! [timing]
//! mcnt_rate_num = 250000000
//! counter_bits = 48
//! pcnt_ratio = 2048
//!
//! [[boards]]
//! host = "roach01"
//! role = "f-engine"
//!
//! [[boards]]
//! host = "roach02"
//! port = 7148
//! role = "x-engine"
//! ```
//!
//! Every field except a board's `host` and `role` has a default, so a file
//! listing only the boards is complete.

use std::path::{Path, PathBuf};
use std::time::Duration;

use corr_core::timing::{CounterSpec, Epoch, Timestamp, TimingError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::arm::ArmSettings;
use crate::application::cluster::{BoardId, BoardRole};
use crate::application::retry::RetryPolicy;
use crate::application::schedule::ScheduleSettings;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid timing settings: {0}")]
    Timing(#[from] TimingError),

    /// A value parsed but is unusable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CorrConfig {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub arm: ArmConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub boards: Vec<BoardEntry>,
}

/// Connection and logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlConfig {
    /// How long a single board request may take.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound on outstanding requests per board connection.
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Sample counter geometry shared by every board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    /// Counter rate is `mcnt_rate_num / mcnt_rate_den` counts per second.
    #[serde(default = "default_rate_num")]
    pub mcnt_rate_num: u64,
    #[serde(default = "default_rate_den")]
    pub mcnt_rate_den: u64,
    #[serde(default = "default_counter_bits")]
    pub counter_bits: u32,
    /// Samples per packet.  Must be a power of two.
    #[serde(default = "default_pcnt_ratio")]
    pub pcnt_ratio: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArmConfig {
    /// Arm only within this many milliseconds after a whole second.  `0`
    /// arms immediately.
    #[serde(default = "default_arm_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Give up polling after this long.  `0` polls forever.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    #[serde(default = "default_min_lead_ms")]
    pub min_lead_ms: u64,
    #[serde(default = "default_network_allowance_ms")]
    pub network_allowance_ms: u64,
    #[serde(default = "default_reset_verify_attempts")]
    pub reset_verify_attempts: u32,
    #[serde(default = "default_reset_verify_interval_ms")]
    pub reset_verify_interval_ms: u64,
}

/// One board of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardEntry {
    pub host: String,
    #[serde(default = "default_board_port")]
    pub port: u16,
    pub role: BoardRole,
}

impl BoardEntry {
    pub fn id(&self) -> BoardId {
        BoardId::from_endpoint(&self.host, self.port)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_connect_timeout_ms() -> u64 {
    3_000
}
fn default_max_outstanding() -> usize {
    crate::application::request_tracker::DEFAULT_CAPACITY
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_rate_num() -> u64 {
    250_000_000
}
fn default_rate_den() -> u64 {
    1
}
fn default_counter_bits() -> u32 {
    48
}
fn default_pcnt_ratio() -> u64 {
    2048
}
fn default_arm_window_ms() -> u64 {
    200
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_max_wait_ms() -> u64 {
    3_000
}
fn default_min_lead_ms() -> u64 {
    2_000
}
fn default_network_allowance_ms() -> u64 {
    500
}
fn default_reset_verify_attempts() -> u32 {
    5
}
fn default_reset_verify_interval_ms() -> u64 {
    100
}
fn default_board_port() -> u16 {
    7147
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_outstanding: default_max_outstanding(),
            log_level: default_log_level(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            mcnt_rate_num: default_rate_num(),
            mcnt_rate_den: default_rate_den(),
            counter_bits: default_counter_bits(),
            pcnt_ratio: default_pcnt_ratio(),
        }
    }
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            window_ms: default_arm_window_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            min_lead_ms: default_min_lead_ms(),
            network_allowance_ms: default_network_allowance_ms(),
            reset_verify_attempts: default_reset_verify_attempts(),
            reset_verify_interval_ms: default_reset_verify_interval_ms(),
        }
    }
}

// ── Conversions into application settings ─────────────────────────────────────

impl ControlConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl TimingConfig {
    /// # Errors
    ///
    /// [`ConfigError::Timing`] for a rate or width the counter model rejects.
    pub fn counter_spec(&self) -> Result<CounterSpec, ConfigError> {
        Ok(CounterSpec::new(
            self.mcnt_rate_num,
            self.mcnt_rate_den,
            self.counter_bits,
        )?)
    }
}

impl CorrConfig {
    /// # Errors
    ///
    /// [`ConfigError::Timing`] if the counter geometry is invalid.
    pub fn arm_settings(&self) -> Result<ArmSettings, ConfigError> {
        Ok(ArmSettings {
            window: nonzero_millis(self.arm.window_ms),
            poll: RetryPolicy::fixed(
                Duration::from_millis(self.arm.poll_interval_ms),
                nonzero_millis(self.arm.max_wait_ms),
            ),
            mcnt: self.timing.counter_spec()?,
            pcnt_ratio: self.timing.pcnt_ratio,
        })
    }

    pub fn schedule_settings(&self) -> ScheduleSettings {
        ScheduleSettings {
            min_lead: Duration::from_millis(self.schedule.min_lead_ms),
            network_allowance: Duration::from_millis(self.schedule.network_allowance_ms),
            reset_verify: RetryPolicy::attempts(
                self.schedule.reset_verify_attempts,
                Duration::from_millis(self.schedule.reset_verify_interval_ms),
            ),
        }
    }

    /// Checks everything that parsing alone cannot.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Timing`] for bad counter geometry, or
    /// [`ConfigError::Invalid`] for zero intervals, a window of a second or
    /// more, or duplicate boards.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mcnt = self.timing.counter_spec()?;
        Epoch::new(Timestamp::from_secs(0), mcnt, self.timing.pcnt_ratio)?;

        if self.control.request_timeout_ms == 0 || self.control.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.control.max_outstanding == 0 {
            return Err(ConfigError::Invalid("max_outstanding must be at least 1".into()));
        }
        if self.arm.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("arm.poll_interval_ms must be non-zero".into()));
        }
        if self.arm.window_ms >= 1_000 {
            return Err(ConfigError::Invalid(
                "arm.window_ms must be shorter than one second".into(),
            ));
        }
        if self.schedule.reset_verify_attempts == 0 {
            return Err(ConfigError::Invalid(
                "schedule.reset_verify_attempts must be at least 1".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for board in &self.boards {
            if board.host.trim().is_empty() {
                return Err(ConfigError::Invalid("board with empty host".into()));
            }
            if !seen.insert(board.id()) {
                return Err(ConfigError::Invalid(format!("duplicate board {}", board.id())));
            }
        }
        Ok(())
    }
}

fn nonzero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default config file path.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads and validates the config at `path`.
///
/// # Errors
///
/// [`ConfigError::Io`] if the file cannot be read (including when it does
/// not exist), [`ConfigError::Parse`] for malformed TOML, or any
/// [`CorrConfig::validate`] error.
pub fn load_from(path: &Path) -> Result<CorrConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: CorrConfig = toml::from_str(&content)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Like [`load_from`], but a missing file yields [`CorrConfig::default`].
///
/// # Errors
///
/// As for [`load_from`], except for "not found".
pub fn load_or_default(path: &Path) -> Result<CorrConfig, ConfigError> {
    match load_from(path) {
        Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            Ok(CorrConfig::default())
        }
        other => other,
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_to(path: &Path, config: &CorrConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("CorrControl"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("corr-control"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("CorrControl")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

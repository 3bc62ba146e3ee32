//! Runtime configuration
//!
//! Serial parameters, per-operation read timeouts and ACK-polling limits,
//! stored as pretty-printed JSON. Missing fields take their defaults, so an
//! empty `{}` file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::protocol::discovery::{HardwareId, ARDUINO_LEONARDO};
use crate::protocol::{SerialOpener, SessionTimings, DEFAULT_BAUD_RATE};

/// Errors loading or saving the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Read or write failed
    #[error("{}: {source}", .path.display())]
    Io {
        /// File being read or written
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// The file is not valid configuration JSON
    #[error("{}: {source}", .path.display())]
    Parse {
        /// File being parsed or serialized
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: serde_json::Error,
    },

    /// A value makes the configuration unusable
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration stored in config.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmpConfig {
    /// Config version for migrations
    pub version: String,

    /// Serial port settings
    pub serial: SerialSettings,

    /// Read timeouts per operation
    pub timeouts: TimeoutSettings,

    /// Limits for the commit and save ACK polls
    pub ack_polling: AckPollingSettings,
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,

    /// Wait after opening a port before talking to the board
    pub settle_after_open_ms: u64,

    /// USB vendor ID of the boards
    pub vid: u16,

    /// USB product ID of the boards
    pub pid: u16,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            settle_after_open_ms: 0,
            vid: ARDUINO_LEONARDO.vid,
            pid: ARDUINO_LEONARDO.pid,
        }
    }
}

/// Read timeouts in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Identify query during discovery
    pub identify_ms: u64,
    /// Channel count query
    pub channel_count_ms: u64,
    /// Each set command while applying values
    pub apply_ms: u64,
    /// Each read of the bulk readout
    pub read_ms: u64,
    /// Per-read timeout inside the EEPROM save poll
    pub save_ms: u64,
    /// LED toggle
    pub led_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            identify_ms: 100,
            channel_count_ms: 100,
            apply_ms: 1000,
            read_ms: 10,
            save_ms: 100,
            led_ms: 100,
        }
    }
}

/// ACK polling limits in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AckPollingSettings {
    /// Sleep between polls
    pub poll_interval_ms: u64,

    /// Give up on the DAC commit ACK after this long
    pub commit_deadline_ms: u64,

    /// Give up on the EEPROM save ACK after this long
    pub save_deadline_ms: u64,
}

impl Default for AckPollingSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            commit_deadline_ms: 15_000,
            save_deadline_ms: 20_000,
        }
    }
}

impl Default for AmpConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            serial: SerialSettings::default(),
            timeouts: TimeoutSettings::default(),
            ack_polling: AckPollingSettings::default(),
        }
    }
}

impl AmpConfig {
    /// `<config dir>/ampctl/config.json`, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ampctl").join("config.json"))
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the default path; fall back to defaults when the file doesn't exist.
    ///
    /// An explicitly given path must exist.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Write the configuration as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source: io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(io_err)
    }

    /// Reject values the protocol can't work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be positive".to_string()));
        }
        if self.ack_polling.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        let t = &self.timeouts;
        if [t.identify_ms, t.channel_count_ms, t.apply_ms, t.read_ms, t.save_ms, t.led_ms]
            .contains(&0)
        {
            return Err(ConfigError::Invalid(
                "read timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// USB id used to pick candidate ports
    pub fn hardware_id(&self) -> HardwareId {
        HardwareId {
            vid: self.serial.vid,
            pid: self.serial.pid,
        }
    }

    /// Opener for real serial ports
    pub fn serial_opener(&self) -> SerialOpener {
        SerialOpener {
            baud_rate: self.serial.baud_rate,
            settle_after_open: Duration::from_millis(self.serial.settle_after_open_ms),
        }
    }

    /// Timeouts and ACK-polling limits for board sessions
    pub fn session_timings(&self) -> SessionTimings {
        let t = &self.timeouts;
        let p = &self.ack_polling;
        SessionTimings {
            identify: Duration::from_millis(t.identify_ms),
            channel_count: Duration::from_millis(t.channel_count_ms),
            apply: Duration::from_millis(t.apply_ms),
            read: Duration::from_millis(t.read_ms),
            save: Duration::from_millis(t.save_ms),
            led: Duration::from_millis(t.led_ms),
            poll_interval: Duration::from_millis(p.poll_interval_ms),
            commit_deadline: Duration::from_millis(p.commit_deadline_ms),
            save_deadline: Duration::from_millis(p.save_deadline_ms),
        }
    }
}

//! # ampctl Core Library
//!
//! Core functionality for configuring SiPM amplifier boards over USB serial.
//!
//! This library provides:
//! - Discovery of amplifier boards by USB hardware id and board identifier
//! - The per-board channel protocol (gain, threshold, DAC commit, EEPROM save, readout)
//! - A fleet coordinator that runs those operations across every board
//! - The caller-owned channel settings table and its two-row CSV format
//! - A simulated board for tests and demo mode
//!
//! ## Example
//!
//! ```rust,ignore
//! use ampctl_core::prelude::*;
//!
//! let config = AmpConfig::load_or_default(None)?;
//! let (fleet, _failures) = Fleet::discover_on_host(&config);
//!
//! for outcome in fleet.read_all() {
//!     let snapshot = outcome.result?;
//!     println!("board {:02}: {:?}", outcome.board.identifier, display_values(&snapshot));
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod protocol;
pub mod settings;
pub mod sim;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::AmpConfig;
    pub use crate::protocol::{
        display_values, swap_channel, ApplyReport, Board, BoardOutcome, BoardSession,
        ChannelValues, DiscoveredBoard, Fleet, PortOpener, ProtocolError, ReadoutSnapshot,
        SerialOpener,
    };
    pub use crate::settings::{ChannelSetting, SettingsTable};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

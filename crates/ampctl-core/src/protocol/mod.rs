//! Amplifier Board Serial Protocol
//!
//! Implements the byte-level protocol spoken by the SiPM amplifier boards:
//! discovery, channel count query, gain/threshold writes with ACK, DAC
//! commit, EEPROM save and the bulk readout terminated by EOT.

mod board;
pub mod commands;
pub mod discovery;
mod error;
mod fleet;
pub mod serial;
pub mod session;
pub mod transport;

pub use board::{
    display_values, ApplyReport, Board, BoardOutcome, ChannelFault, ChannelValues,
    ReadoutSnapshot,
};
pub use commands::{swap_channel, Command, ValueKind};
pub use discovery::{DiscoveredBoard, DiscoveryReport, HardwareId, PortFailure};
pub use error::ProtocolError;
pub use fleet::Fleet;
pub use serial::{list_ports, PortInfo, SerialOpener};
pub use session::{BoardSession, Link, OperationState, SessionTimings};
pub use transport::{PortOpener, Transport};

/// Baud rate of the board firmware
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Acknowledge byte sent after every accepted command
pub const ACK: u8 = 0x06;

/// End-of-transmission marker in the readout trailer
pub const EOT: u8 = 0x04;

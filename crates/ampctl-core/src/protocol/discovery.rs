//! Board discovery
//!
//! Finds every attached board by USB hardware id, asks each one for its
//! identifier and orders the result by that identifier, so the mapping from
//! identifier to display position does not depend on enumeration order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::commands::Command;
use super::serial::PortInfo;
use super::transport::PortOpener;
use super::ProtocolError;

/// USB vendor/product pair used to pick candidate ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareId {
    /// USB vendor ID
    pub vid: u16,
    /// USB product ID
    pub pid: u16,
}

/// Arduino Leonardo, the controller on every amplifier board
pub const ARDUINO_LEONARDO: HardwareId = HardwareId {
    vid: 0x2341,
    pid: 0x8036,
};

impl HardwareId {
    /// Check whether a port belongs to this hardware
    pub fn matches(&self, port: &PortInfo) -> bool {
        port.vid == Some(self.vid) && port.pid == Some(self.pid)
    }
}

impl fmt::Display for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vid, self.pid)
    }
}

/// A board that answered the identify command
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveredBoard {
    /// Identifier reported by the firmware
    pub identifier: u8,
    /// Serial port the board answered on
    pub port: String,
}

/// A candidate port that could not be identified
#[derive(Debug)]
pub struct PortFailure {
    /// Port name
    pub port: String,
    /// What went wrong
    pub error: ProtocolError,
}

/// Outcome of a discovery pass
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Boards sorted ascending by identifier
    pub boards: Vec<DiscoveredBoard>,
    /// Candidate ports that did not answer
    pub failures: Vec<PortFailure>,
}

/// Names of the ports whose hardware id matches `hwid`
pub fn list_candidate_ports(ports: &[PortInfo], hwid: HardwareId) -> Vec<String> {
    ports
        .iter()
        .filter(|p| hwid.matches(p))
        .map(|p| p.name.clone())
        .collect()
}

/// Ask the board on `port` for its identifier
pub fn query_board_identifier(
    opener: &dyn PortOpener,
    port: &str,
    timeout: Duration,
) -> Result<u8, ProtocolError> {
    let mut transport = opener.open(port, timeout)?;
    let cmd = Command::Identify;
    transport.write_all(&cmd.to_bytes())?;
    transport
        .read_byte()?
        .ok_or(ProtocolError::MissingResponse {
            command: cmd.name(),
        })
}

/// Identify every candidate port and sort the boards by identifier.
///
/// A port that fails to answer is recorded in the report and logged; it does
/// not stop the remaining ports from being queried.
pub fn discover_all(opener: &dyn PortOpener, ports: &[String], timeout: Duration) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();

    for port in ports {
        match query_board_identifier(opener, port, timeout) {
            Ok(identifier) => {
                tracing::info!("Found board ID {identifier:02} on {port}");
                report.boards.push(DiscoveredBoard {
                    identifier,
                    port: port.clone(),
                });
            }
            Err(error) => {
                tracing::warn!("No board identifier from {port}: {error}");
                report.failures.push(PortFailure {
                    port: port.clone(),
                    error,
                });
            }
        }
    }

    sort_by_identifier(&mut report.boards);
    report
}

/// Sort boards ascending by identifier, ties broken by port name
pub fn sort_by_identifier(boards: &mut [DiscoveredBoard]) {
    boards.sort();
}

//! Board records and per-board results

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use super::commands::{swap_channel, Command, ValueKind, THRESHOLD_LEADING_OFFSET};
use super::ProtocolError;

/// A discovered board with its channel count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    /// Identifier reported by the firmware, used as sort and display key
    pub identifier: u8,
    /// Serial port the board is attached to
    pub port: String,
    /// Number of amplifier channels
    pub channel_count: u8,
}

/// One channel's gain and threshold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelValues {
    /// 12-bit gain
    pub gain: u16,
    /// 12-bit threshold
    pub threshold: u16,
}

/// Values read back from one board, in wire order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadoutSnapshot {
    /// Gains as transmitted (still in swapped channel order)
    pub gains: Vec<u16>,
    /// Thresholds, one per channel
    pub thresholds: Vec<u16>,
    /// Whether the trailer carried the EOT marker
    pub eot_received: bool,
}

impl ReadoutSnapshot {
    /// Decode the gain and threshold buffers of a bulk read.
    ///
    /// Gain `ch` is the big-endian pair at `2*ch` of `gain_buf`; threshold
    /// `ch` is the pair at `2*ch + 2` of `threshold_buf`. Buffers shorter than
    /// `2*N` and `2*N + 2` bytes are a [`ProtocolError::ShortRead`].
    pub fn decode(
        channel_count: u8,
        gain_buf: &[u8],
        threshold_buf: &[u8],
    ) -> Result<Self, ProtocolError> {
        let n = channel_count as usize;
        let required = [
            (gain_buf, 2 * n),
            (threshold_buf, 2 * n + THRESHOLD_LEADING_OFFSET),
        ];
        for (buf, expected) in required {
            if buf.len() < expected {
                return Err(ProtocolError::ShortRead {
                    command: Command::ReadValues.name(),
                    expected,
                    actual: buf.len(),
                });
            }
        }

        let gains = (0..n)
            .map(|ch| BigEndian::read_u16(&gain_buf[2 * ch..]))
            .collect();
        let thresholds = (0..n)
            .map(|ch| BigEndian::read_u16(&threshold_buf[2 * ch + THRESHOLD_LEADING_OFFSET..]))
            .collect();
        Ok(Self {
            gains,
            thresholds,
            eot_received: true,
        })
    }

    /// Number of channels in this snapshot
    pub fn channel_count(&self) -> u8 {
        self.gains.len() as u8
    }
}

/// Map a snapshot back onto channel slots.
///
/// Gains are read through the same pair swap used when writing them;
/// thresholds map directly.
pub fn display_values(snapshot: &ReadoutSnapshot) -> Vec<ChannelValues> {
    let count = snapshot.channel_count();
    (0..count)
        .map(|ch| ChannelValues {
            gain: snapshot.gains[swap_channel(ch, count) as usize],
            threshold: snapshot.thresholds[ch as usize],
        })
        .collect()
}

/// A channel write that was abandoned
#[derive(Debug)]
pub struct ChannelFault {
    /// Channel slot (before any swap)
    pub channel: u8,
    /// Which value failed
    pub kind: ValueKind,
    /// Why it failed
    pub error: ProtocolError,
}

/// Result of applying values to one board
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Channel writes acknowledged by the board
    pub acknowledged: usize,
    /// Channel writes that were abandoned
    pub faults: Vec<ChannelFault>,
}

impl ApplyReport {
    /// True when every write was acknowledged
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }
}

/// Result of one fleet operation on one board
#[derive(Debug)]
pub struct BoardOutcome<T> {
    /// The board the operation ran on
    pub board: Board,
    /// What happened
    pub result: Result<T, ProtocolError>,
}

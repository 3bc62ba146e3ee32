//! Protocol commands
//!
//! Defines the commands understood by the amplifier board firmware and the
//! encoding helpers for channel values.
//!
//! Simple commands are one or two ASCII letters followed by a newline. The
//! set commands carry the channel and the two halves of a 12-bit value as
//! decimal ASCII numbers, each terminated by `/`.

use std::fmt;

use super::{ACK, EOT};

/// Delimiter after each decimal field of a set command
pub const FIELD_DELIMITER: u8 = b'/';

/// Number of trailer bytes after a bulk read
pub const TRAILER_LEN: usize = 4;

/// Position of the EOT marker inside the trailer
pub const TRAILER_EOT_INDEX: usize = 2;

/// Leading bytes in the threshold buffer that carry no channel value
pub const THRESHOLD_LEADING_OFFSET: usize = 2;

/// Largest value a 12-bit DAC channel accepts
pub const MAX_CHANNEL_VALUE: u16 = 0x0FFF;

/// Which of the two per-channel values a set command addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Amplifier gain
    Gain,
    /// Discriminator threshold
    Threshold,
}

impl ValueKind {
    /// Two-letter opcode on the wire
    pub fn opcode(&self) -> &'static [u8; 2] {
        match self {
            ValueKind::Gain => b"SG",
            ValueKind::Threshold => b"ST",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Gain => write!(f, "gain"),
            ValueKind::Threshold => write!(f, "threshold"),
        }
    }
}

/// Protocol commands for board communication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask for the board identifier (`I`)
    Identify,

    /// Ask for the number of channels (`G`)
    GetChannels,

    /// Set one channel's gain or threshold (`SG` / `ST`)
    SetValue {
        /// Gain or threshold
        kind: ValueKind,
        /// Channel index as transmitted (already swapped for gain)
        wire_channel: u8,
        /// 12-bit value
        value: u16,
    },

    /// Push pending values to the DAC (`W`)
    WriteValues,

    /// Persist applied values to EEPROM (`SV`)
    SaveToEeprom,

    /// Bulk read of every gain and threshold (`R`)
    ReadValues,

    /// Toggle the status LED (`L`)
    ToggleLed,
}

impl Command {
    /// Short name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify => "identify",
            Command::GetChannels => "get channels",
            Command::SetValue {
                kind: ValueKind::Gain,
                ..
            } => "set gain",
            Command::SetValue {
                kind: ValueKind::Threshold,
                ..
            } => "set threshold",
            Command::WriteValues => "write values",
            Command::SaveToEeprom => "save to EEPROM",
            Command::ReadValues => "read values",
            Command::ToggleLed => "toggle LED",
        }
    }

    /// Encode the command to the bytes sent on the wire
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            Command::Identify => b"I\n".to_vec(),
            Command::GetChannels => b"G\n".to_vec(),
            Command::SetValue {
                kind,
                wire_channel,
                value,
            } => {
                let (hi, lo) = split_value(value);
                let mut bytes = Vec::with_capacity(14);
                bytes.extend_from_slice(kind.opcode());
                for field in [wire_channel, hi, lo] {
                    bytes.extend_from_slice(field.to_string().as_bytes());
                    bytes.push(FIELD_DELIMITER);
                }
                bytes
            }
            Command::WriteValues => b"W\n".to_vec(),
            Command::SaveToEeprom => b"SV\n".to_vec(),
            Command::ReadValues => b"R\n".to_vec(),
            Command::ToggleLed => b"L\n".to_vec(),
        }
    }

    /// Check if the board acknowledges this command with ACK
    pub fn expects_ack(&self) -> bool {
        matches!(
            self,
            Command::GetChannels
                | Command::SetValue { .. }
                | Command::WriteValues
                | Command::SaveToEeprom
        )
    }

    /// Check if the ACK only arrives after a slow operation and must be polled for
    pub fn polls_for_ack(&self) -> bool {
        matches!(self, Command::WriteValues | Command::SaveToEeprom)
    }
}

/// Swap a channel index with its even/odd partner.
///
/// The amplifier's gain DACs are wired with each pair of channels crossed,
/// so gain channel `2i` is addressed as `2i + 1` and vice versa. Threshold
/// channels are not affected. A trailing unpaired channel on a board with an
/// odd channel count maps to itself.
pub fn swap_channel(channel: u8, channel_count: u8) -> u8 {
    let partner = channel ^ 1;
    if partner < channel_count {
        partner
    } else {
        channel
    }
}

/// Split a 12-bit value into its high and low byte
pub fn split_value(value: u16) -> (u8, u8) {
    ((value >> 8) as u8, (value & 0xFF) as u8)
}

/// Join a high and low byte into a value
pub fn join_value(hi: u8, lo: u8) -> u16 {
    (u16::from(hi) << 8) | u16::from(lo)
}

/// Describe a received control byte for logs
pub(crate) fn describe_byte(byte: u8) -> String {
    match byte {
        ACK => "ACK".to_string(),
        EOT => "EOT".to_string(),
        b if b.is_ascii_graphic() => format!("{:#04x} ('{}')", b, b as char),
        b => format!("{:#04x}", b),
    }
}

//! Channel settings table
//!
//! The desired gain/threshold for every `(board, channel)` slot, owned by the
//! caller and handed to the fleet when applying. Also reads and writes the
//! two-row CSV files used to keep settings between runs: first row gains,
//! second row thresholds, comma separated, in channel order.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;

use crate::protocol::commands::MAX_CHANNEL_VALUE;
use crate::protocol::{display_values, Board, ChannelValues, ReadoutSnapshot};

/// Errors reading or writing settings
#[derive(Error, Debug)]
pub enum SettingsError {
    /// File could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The CSV has fewer than two rows
    #[error("CSV is missing the {0} row")]
    MissingRow(&'static str),

    /// A cell is not a number
    #[error("row {row}, column {column}: '{value}' is not a number")]
    InvalidCell {
        /// 1-based row
        row: usize,
        /// 1-based column
        column: usize,
        /// Cell text as found
        value: String,
    },

    /// A cell is outside 0..=4095
    #[error("row {row}, column {column}: {value} is outside 0..=4095")]
    OutOfRange {
        /// 1-based row
        row: usize,
        /// 1-based column
        column: usize,
        /// Parsed value
        value: u32,
    },

    /// A channel needed for export has no value
    #[error("board {board} has no value for channel {channel}")]
    MissingChannel {
        /// Board position
        board: usize,
        /// Channel slot without a value
        channel: u8,
    },
}

/// Desired values for one channel of one board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSetting {
    /// Position of the board in discovery order
    pub board_index: usize,
    /// Channel slot on that board
    pub channel_index: u8,
    /// 12-bit gain
    pub gain: u16,
    /// 12-bit threshold
    pub threshold: u16,
}

/// Desired values keyed by `(board_index, channel_index)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsTable {
    entries: BTreeMap<(usize, u8), ChannelValues>,
}

impl SettingsTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace one channel's values
    pub fn set(&mut self, setting: ChannelSetting) {
        self.entries.insert(
            (setting.board_index, setting.channel_index),
            ChannelValues {
                gain: setting.gain,
                threshold: setting.threshold,
            },
        );
    }

    /// Values for one slot
    pub fn get(&self, board_index: usize, channel_index: u8) -> Option<ChannelValues> {
        self.entries.get(&(board_index, channel_index)).copied()
    }

    /// All settings for one board, ordered by channel
    pub fn for_board(&self, board_index: usize) -> Vec<ChannelSetting> {
        self.entries
            .range((board_index, 0)..=(board_index, u8::MAX))
            .map(|(&(board_index, channel_index), v)| ChannelSetting {
                board_index,
                channel_index,
                gain: v.gain,
                threshold: v.threshold,
            })
            .collect()
    }

    /// Number of slots with values
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no slot has values
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store a board readout, mapping gains back through the channel swap
    pub fn record_readout(&mut self, board_index: usize, snapshot: &ReadoutSnapshot) {
        for (channel, values) in display_values(snapshot).into_iter().enumerate() {
            self.entries.insert((board_index, channel as u8), values);
        }
    }

    /// Load gains/thresholds rows for one board, ignoring values past its channel count
    pub fn import_board(
        &mut self,
        board_index: usize,
        channel_count: u8,
        gains: &[u16],
        thresholds: &[u16],
    ) {
        for (channel, (&gain, &threshold)) in gains
            .iter()
            .zip(thresholds)
            .take(channel_count as usize)
            .enumerate()
        {
            self.set(ChannelSetting {
                board_index,
                channel_index: channel as u8,
                gain,
                threshold,
            });
        }
    }

    /// Load the same rows into every board
    pub fn import_all(&mut self, boards: &[Board], gains: &[u16], thresholds: &[u16]) {
        for (index, board) in boards.iter().enumerate() {
            self.import_board(index, board.channel_count, gains, thresholds);
        }
    }

    /// Gains and thresholds rows for one board
    pub fn export_board(
        &self,
        board_index: usize,
        channel_count: u8,
    ) -> Result<(Vec<u16>, Vec<u16>), SettingsError> {
        let mut gains = Vec::with_capacity(channel_count as usize);
        let mut thresholds = Vec::with_capacity(channel_count as usize);
        for channel in 0..channel_count {
            let values = self
                .get(board_index, channel)
                .ok_or(SettingsError::MissingChannel {
                    board: board_index,
                    channel,
                })?;
            gains.push(values.gain);
            thresholds.push(values.threshold);
        }
        Ok((gains, thresholds))
    }
}

/// Parse the two-row settings CSV
pub fn parse_csv(text: &str) -> Result<(Vec<u16>, Vec<u16>), SettingsError> {
    let mut rows = text.lines().filter(|l| !l.trim().is_empty());
    let gains = parse_row(rows.next().ok_or(SettingsError::MissingRow("gain"))?, 1)?;
    let thresholds = parse_row(
        rows.next().ok_or(SettingsError::MissingRow("threshold"))?,
        2,
    )?;
    Ok((gains, thresholds))
}

fn parse_row(line: &str, row: usize) -> Result<Vec<u16>, SettingsError> {
    line.split(',')
        .enumerate()
        .map(|(i, cell)| {
            let cell = cell.trim();
            let value: u32 = cell.parse().map_err(|_| SettingsError::InvalidCell {
                row,
                column: i + 1,
                value: cell.to_string(),
            })?;
            if value > u32::from(MAX_CHANNEL_VALUE) {
                return Err(SettingsError::OutOfRange {
                    row,
                    column: i + 1,
                    value,
                });
            }
            Ok(value as u16)
        })
        .collect()
}

/// Read a settings CSV from any reader
pub fn read_csv<R: Read>(mut reader: R) -> Result<(Vec<u16>, Vec<u16>), SettingsError> {
    let mut text = String::new();
    reader.read_to_string(&mut text)?;
    parse_csv(&text)
}

/// Read a settings CSV file
pub fn read_csv_file<P: AsRef<Path>>(path: P) -> Result<(Vec<u16>, Vec<u16>), SettingsError> {
    read_csv(File::open(path)?)
}

/// Write the two settings rows
pub fn write_csv<W: Write>(writer: W, gains: &[u16], thresholds: &[u16]) -> io::Result<()> {
    let mut writer = BufWriter::new(writer);
    for row in [gains, thresholds] {
        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(writer, "{}", line.join(","))?;
    }
    writer.flush()
}

/// Write the two settings rows to a file
pub fn write_csv_file<P: AsRef<Path>>(path: P, gains: &[u16], thresholds: &[u16]) -> io::Result<()> {
    write_csv(File::create(path)?, gains, thresholds)
}

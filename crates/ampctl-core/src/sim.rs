//! Simulated amplifier boards
//!
//! An in-process stand-in for the board firmware, for tests and for demo
//! mode when no hardware is attached. It parses the same byte commands as the
//! real boards and answers with the same bytes, including the two-byte
//! threshold offset and the EOT trailer. Gains are stored at the channel
//! index received on the wire, so the pair swap shows up exactly as it does
//! on real hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::protocol::commands::{join_value, FIELD_DELIMITER, MAX_CHANNEL_VALUE};
use crate::protocol::{PortOpener, ProtocolError, Transport, ACK, EOT};

/// Byte a simulated board sends for a rejected set command
pub const NAK: u8 = 0x15;

/// Firmware state of one simulated board
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    /// Identifier answered to `I`
    pub identifier: u8,
    /// Gains in wire channel order, as last written
    pub gains: Vec<u16>,
    /// Thresholds, as last written
    pub thresholds: Vec<u16>,
    /// Values latched into the DAC by the last `W`
    pub dac: Option<(Vec<u16>, Vec<u16>)>,
    /// Values persisted by the last `SV`
    pub eeprom: Option<(Vec<u16>, Vec<u16>)>,
    /// LED state, flipped by `L`
    pub led_on: bool,
    /// Empty reads before a `W` or `SV` is acknowledged
    pub busy_reads: usize,
    /// Never send anything
    pub silent: bool,
    /// Never acknowledge `W` or `SV`
    pub withhold_slow_ack: bool,
    /// Follow the channel count with NAK instead of ACK
    pub reject_channel_query: bool,
    /// Byte placed at the EOT position of the readout trailer
    pub trailer_marker: u8,
    /// Every byte received, in order
    pub received: Vec<u8>,
    /// Number of times a transport was opened on this board
    pub opens: usize,
    pending_busy: usize,
    input: Vec<u8>,
    output: VecDeque<u8>,
}

impl SimulatedBoard {
    /// A board with `channel_count` channels, all values zero
    pub fn new(identifier: u8, channel_count: u8) -> Self {
        let n = channel_count as usize;
        Self {
            identifier,
            gains: vec![0; n],
            thresholds: vec![0; n],
            dac: None,
            eeprom: None,
            led_on: false,
            busy_reads: 0,
            silent: false,
            withhold_slow_ack: false,
            reject_channel_query: false,
            trailer_marker: EOT,
            received: Vec::new(),
            opens: 0,
            pending_busy: 0,
            input: Vec::new(),
            output: VecDeque::new(),
        }
    }

    /// Number of channels
    pub fn channel_count(&self) -> u8 {
        self.gains.len() as u8
    }

    /// Feed bytes from the host and run every complete command
    fn receive(&mut self, bytes: &[u8]) {
        self.received.extend_from_slice(bytes);
        self.input.extend_from_slice(bytes);
        while let Some((consumed, command)) = self.next_command() {
            self.input.drain(..consumed);
            self.execute(&command);
        }
    }

    /// Split the next complete command off the input buffer
    fn next_command(&self) -> Option<(usize, Vec<u8>)> {
        let buf = &self.input;
        if buf.len() >= 2 && buf[0] == b'S' && (buf[1] == b'G' || buf[1] == b'T') {
            let mut delimiters = buf
                .iter()
                .enumerate()
                .filter(|&(_, &b)| b == FIELD_DELIMITER)
                .map(|(i, _)| i);
            let end = delimiters.nth(2)?;
            return Some((end + 1, buf[..=end].to_vec()));
        }
        let end = buf.iter().position(|&b| b == b'\n')?;
        Some((end + 1, buf[..end].to_vec()))
    }

    fn execute(&mut self, command: &[u8]) {
        match command {
            b"I" => self.output.push_back(self.identifier),
            b"G" => {
                self.output.push_back(self.channel_count());
                self.output
                    .push_back(if self.reject_channel_query { NAK } else { ACK });
            }
            b"W" => {
                self.dac = Some((self.gains.clone(), self.thresholds.clone()));
                self.ack_after_busy();
            }
            b"SV" => {
                self.eeprom = self.dac.clone();
                self.ack_after_busy();
            }
            b"R" => self.send_readout(),
            b"L" => self.led_on = !self.led_on,
            [b'S', kind @ (b'G' | b'T'), fields @ ..] => {
                let reply = match parse_set_fields(fields) {
                    Some((channel, value))
                        if (channel as usize) < self.gains.len() && value <= MAX_CHANNEL_VALUE =>
                    {
                        if *kind == b'G' {
                            self.gains[channel as usize] = value;
                        } else {
                            self.thresholds[channel as usize] = value;
                        }
                        ACK
                    }
                    _ => NAK,
                };
                self.output.push_back(reply);
            }
            other => tracing::debug!("simulated board ignoring {:02x?}", other),
        }
    }

    fn ack_after_busy(&mut self) {
        if self.withhold_slow_ack {
            return;
        }
        self.pending_busy = self.busy_reads;
        self.output.push_back(ACK);
    }

    fn send_readout(&mut self) {
        for &gain in &self.gains {
            self.output.extend(gain.to_be_bytes());
        }
        self.output.extend([0xFF, 0xFF]);
        for &threshold in &self.thresholds {
            self.output.extend(threshold.to_be_bytes());
        }
        self.output.extend([0x00, 0x00, self.trailer_marker, 0x00]);
    }

    /// Bytes the host would read, honouring busy reads and silence
    fn send(&mut self, n: usize) -> Vec<u8> {
        if self.silent {
            return Vec::new();
        }
        if self.pending_busy > 0 {
            self.pending_busy -= 1;
            return Vec::new();
        }
        let take = n.min(self.output.len());
        self.output.drain(..take).collect()
    }
}

/// Parse `<channel>/<hi>/<lo>/`
fn parse_set_fields(fields: &[u8]) -> Option<(u8, u16)> {
    let text = std::str::from_utf8(fields).ok()?;
    let mut parts = text.split('/');
    let channel: u8 = parts.next()?.parse().ok()?;
    let hi: u8 = parts.next()?.parse().ok()?;
    let lo: u8 = parts.next()?.parse().ok()?;
    Some((channel, join_value(hi, lo)))
}

fn lock(board: &Mutex<SimulatedBoard>) -> MutexGuard<'_, SimulatedBoard> {
    board.lock().unwrap_or_else(|e| e.into_inner())
}

/// Transport connected to a simulated board
pub struct SimTransport {
    port_name: String,
    board: Arc<Mutex<SimulatedBoard>>,
}

impl Transport for SimTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        lock(&self.board).receive(bytes);
        Ok(())
    }

    fn read_up_to(&mut self, n: usize) -> Result<Vec<u8>, ProtocolError> {
        Ok(lock(&self.board).send(n))
    }
}

/// Opens transports onto a set of simulated boards keyed by port name
#[derive(Default, Clone)]
pub struct SimOpener {
    boards: HashMap<String, Arc<Mutex<SimulatedBoard>>>,
}

impl SimOpener {
    /// An opener with no boards
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `board` at `port`
    pub fn attach(&mut self, port: impl Into<String>, board: SimulatedBoard) -> Arc<Mutex<SimulatedBoard>> {
        let board = Arc::new(Mutex::new(board));
        self.boards.insert(port.into(), board.clone());
        board
    }

    /// Port names with a board attached, sorted
    pub fn ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.boards.keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Handle to the board on `port`
    pub fn board(&self, port: &str) -> Option<Arc<Mutex<SimulatedBoard>>> {
        self.boards.get(port).cloned()
    }

    /// `count` eight-channel boards whose identifiers run against port order
    pub fn demo(count: u8) -> Self {
        let mut opener = Self::new();
        for i in 0..count {
            let mut board = SimulatedBoard::new(count - i, 8);
            for ch in 0..8u16 {
                board.gains[ch as usize] = 1000 + 100 * u16::from(i) + ch;
                board.thresholds[ch as usize] = 200 + ch;
            }
            board.dac = Some((board.gains.clone(), board.thresholds.clone()));
            board.eeprom = board.dac.clone();
            opener.attach(format!("sim{i}"), board);
        }
        opener
    }
}

impl PortOpener for SimOpener {
    fn open(&self, port: &str, _timeout: Duration) -> Result<Box<dyn Transport>, ProtocolError> {
        let board = self
            .boards
            .get(port)
            .ok_or_else(|| ProtocolError::ConnectionFailed {
                port: port.to_string(),
                reason: "no simulated board attached".to_string(),
            })?;
        lock(board).opens += 1;
        Ok(Box::new(SimTransport {
            port_name: port.to_string(),
            board: board.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_commands_split_on_delimiters() {
        let mut board = SimulatedBoard::new(1, 4);
        board.receive(b"SG1/15/");
        assert!(board.output.is_empty(), "incomplete command must wait");
        board.receive(b"255/ST3/0/7/");
        assert_eq!(board.gains, vec![0, 4095, 0, 0]);
        assert_eq!(board.thresholds, vec![0, 0, 0, 7]);
        assert_eq!(board.send(8), vec![ACK, ACK]);
    }

    #[test]
    fn test_out_of_range_channel_is_nak() {
        let mut board = SimulatedBoard::new(1, 2);
        board.receive(b"ST5/0/1/");
        assert_eq!(board.send(1), vec![NAK]);
    }

    #[test]
    fn test_value_above_12_bits_is_nak() {
        let mut board = SimulatedBoard::new(1, 2);
        board.receive(b"SG0/16/0/");
        assert_eq!(board.send(1), vec![NAK]);
        assert_eq!(board.gains, vec![0, 0]);
    }

    #[test]
    fn test_save_is_not_a_set_command() {
        let mut board = SimulatedBoard::new(1, 2);
        board.gains = vec![3, 4];
        board.receive(b"W\nSV\n");
        assert_eq!(board.eeprom, Some((vec![3, 4], vec![0, 0])));
        assert_eq!(board.send(4), vec![ACK, ACK]);
    }

    #[test]
    fn test_busy_reads_delay_ack() {
        let mut board = SimulatedBoard::new(1, 2);
        board.busy_reads = 2;
        board.receive(b"W\n");
        assert!(board.send(1).is_empty());
        assert!(board.send(1).is_empty());
        assert_eq!(board.send(1), vec![ACK]);
    }

    #[test]
    fn test_readout_layout() {
        let mut board = SimulatedBoard::new(1, 2);
        board.gains = vec![10, 20];
        board.thresholds = vec![5, 6];
        board.receive(b"R\n");
        assert_eq!(
            board.send(64),
            vec![0, 10, 0, 20, 0xFF, 0xFF, 0, 5, 0, 6, 0, 0, EOT, 0]
        );
    }

    #[test]
    fn test_demo_identifiers_run_backwards() {
        let opener = SimOpener::demo(3);
        assert_eq!(opener.ports(), vec!["sim0", "sim1", "sim2"]);
        let first = opener.board("sim0").unwrap();
        assert_eq!(lock(&first).identifier, 3);
    }

    #[test]
    fn test_unknown_port_fails_to_open() {
        let opener = SimOpener::new();
        let err = opener.open("sim9", Duration::from_millis(1)).err().unwrap();
        assert!(err.is_connection_error());
    }
}

//! Board session
//!
//! The channel-level protocol for one board. Every operation opens its own
//! transport, runs to completion and closes it again; nothing is kept
//! between operations. Opening the port can reset the board, and the
//! firmware is known to cope with that.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::board::{ApplyReport, Board, ChannelFault, ReadoutSnapshot};
use super::commands::{
    describe_byte, swap_channel, Command, ValueKind, TRAILER_EOT_INDEX, TRAILER_LEN,
};
use super::transport::{PortOpener, Transport};
use super::{ProtocolError, ACK, EOT};
use crate::settings::ChannelSetting;

/// Per-operation read timeouts and ACK-polling limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTimings {
    /// Read timeout for the identify command
    pub identify: Duration,
    /// Read timeout for the channel count query
    pub channel_count: Duration,
    /// Read timeout while applying values
    pub apply: Duration,
    /// Read timeout for the bulk readout
    pub read: Duration,
    /// Read timeout while saving to EEPROM
    pub save: Duration,
    /// Read timeout for the LED toggle
    pub led: Duration,
    /// Sleep between ACK polls
    pub poll_interval: Duration,
    /// Longest wait for the DAC commit ACK
    pub commit_deadline: Duration,
    /// Longest wait for the EEPROM save ACK
    pub save_deadline: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            identify: Duration::from_millis(100),
            channel_count: Duration::from_millis(100),
            apply: Duration::from_millis(1000),
            read: Duration::from_millis(10),
            save: Duration::from_millis(100),
            led: Duration::from_millis(100),
            poll_interval: Duration::from_millis(100),
            commit_deadline: Duration::from_secs(15),
            save_deadline: Duration::from_secs(20),
        }
    }
}

impl SessionTimings {
    /// How long to poll for the ACK of a slow command
    pub fn ack_deadline(&self, cmd: Command) -> Duration {
        match cmd {
            Command::SaveToEeprom => self.save_deadline,
            _ => self.commit_deadline,
        }
    }
}

/// Where an operation ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// No transport held
    Idle,
    /// Opening the transport
    Connecting,
    /// Command sent, waiting for the board
    AwaitingResponse,
    /// Board answered as expected
    Success,
    /// Board stayed silent
    TimedOut,
    /// Board answered with something other than ACK
    NakReceived,
    /// Caller cancelled the ACK poll
    Cancelled,
    /// Port could not be opened or the I/O failed
    Failed,
    /// Transport released
    Closed,
}

impl OperationState {
    /// Terminal state for a finished operation
    pub fn from_result<T>(result: &Result<T, ProtocolError>) -> Self {
        match result {
            Ok(_) => OperationState::Success,
            Err(ProtocolError::NoAck { .. }) => OperationState::NakReceived,
            Err(ProtocolError::Cancelled { .. }) => OperationState::Cancelled,
            Err(e) if e.is_timeout() => OperationState::TimedOut,
            Err(_) => OperationState::Failed,
        }
    }
}

/// The protocol operations for one board
#[derive(Clone)]
pub struct BoardSession {
    opener: Arc<dyn PortOpener>,
    port: String,
    timings: SessionTimings,
    cancel: CancellationToken,
}

impl BoardSession {
    /// Create a session for the board on `port`
    pub fn new(opener: Arc<dyn PortOpener>, port: impl Into<String>, timings: SessionTimings) -> Self {
        Self {
            opener,
            port: port.into(),
            timings,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a session for a discovered board
    pub fn for_board(opener: Arc<dyn PortOpener>, board: &Board, timings: SessionTimings) -> Self {
        Self::new(opener, board.port.clone(), timings)
    }

    /// Use `cancel` to abort ACK polling from another thread
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Port this session talks to
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Token that aborts pending ACK polls when cancelled
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Open a transport, run `op` on it and close it again
    fn run<T>(
        &self,
        name: &'static str,
        timeout: Duration,
        op: impl FnOnce(&mut dyn Transport) -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        tracing::trace!(
            "{} {name}: {:?} -> {:?}",
            self.port,
            OperationState::Idle,
            OperationState::Connecting
        );
        let mut transport = self.opener.open(&self.port, timeout).inspect_err(|e| {
            tracing::trace!("{} {name}: {:?} ({e})", self.port, OperationState::Failed)
        })?;
        tracing::trace!("{} {name}: {:?}", self.port, OperationState::AwaitingResponse);
        let result = op(transport.as_mut());
        drop(transport);
        tracing::trace!(
            "{} {name}: {:?} -> {:?}",
            self.port,
            OperationState::from_result(&result),
            OperationState::Closed
        );
        result
    }

    /// Ask the board how many channels it has.
    ///
    /// The count byte must be followed by ACK; anything else fails the query.
    pub fn get_channel_count(&self) -> Result<u8, ProtocolError> {
        let cmd = Command::GetChannels;
        self.run(cmd.name(), self.timings.channel_count, |t| {
            t.write_all(&cmd.to_bytes())?;
            let count = t.read_byte()?.ok_or(ProtocolError::MissingResponse {
                command: cmd.name(),
            })?;
            self.acknowledge(t, cmd)?;
            Ok(count)
        })
    }

    /// Open a connection for writing channel values
    pub fn link(&self, channel_count: u8) -> Result<Link<'_>, ProtocolError> {
        let transport = self.opener.open(&self.port, self.timings.apply)?;
        Ok(Link {
            session: self,
            transport,
            channel_count,
        })
    }

    /// Write gain then threshold for every setting, then commit to the DAC.
    ///
    /// One connection is used for the whole board. A channel write that is
    /// not acknowledged is logged, recorded in the report and skipped; the
    /// remaining channels are still written. Settings for channels beyond
    /// `channel_count` are ignored.
    pub fn apply(
        &self,
        channel_count: u8,
        settings: &[ChannelSetting],
    ) -> Result<ApplyReport, ProtocolError> {
        tracing::info!("Applying values on {}", self.port);
        let mut link = self.link(channel_count)?;
        let mut report = ApplyReport::default();

        for setting in settings {
            if setting.channel_index >= channel_count {
                tracing::warn!(
                    "{}: channel {} out of range ({} channels), skipped",
                    self.port,
                    setting.channel_index,
                    channel_count
                );
                continue;
            }
            for (kind, value) in [
                (ValueKind::Gain, setting.gain),
                (ValueKind::Threshold, setting.threshold),
            ] {
                match link.set_value(kind, setting.channel_index, value) {
                    Ok(()) => report.acknowledged += 1,
                    Err(error) => {
                        tracing::warn!(
                            "{}: {} ch{} comm error: {error}",
                            self.port,
                            kind,
                            setting.channel_index
                        );
                        report.faults.push(ChannelFault {
                            channel: setting.channel_index,
                            kind,
                            error,
                        });
                    }
                }
            }
        }

        link.commit_to_dac()?;
        tracing::info!(
            "Applying values on {} done ({} acknowledged, {} abandoned)",
            self.port,
            report.acknowledged,
            report.faults.len()
        );
        Ok(report)
    }

    /// Persist the values already applied to the DAC into EEPROM.
    ///
    /// The board may take around ten seconds per save.
    pub fn save_to_eeprom(&self) -> Result<(), ProtocolError> {
        let cmd = Command::SaveToEeprom;
        tracing::info!("Saving to EEPROM on {}: waiting for ACK", self.port);
        self.run(cmd.name(), self.timings.save, |t| self.exchange(t, cmd))?;
        tracing::info!("Saving to EEPROM on {}: ACK received", self.port);
        Ok(())
    }

    /// Read every gain and threshold back from the board.
    ///
    /// A missing EOT in the trailer is logged but the values are still
    /// returned; too few value bytes fail the read.
    pub fn read_all(&self, channel_count: u8) -> Result<ReadoutSnapshot, ProtocolError> {
        let cmd = Command::ReadValues;
        self.run(cmd.name(), self.timings.read, |t| {
            t.write_all(&cmd.to_bytes())?;

            let gain_len = 2 * channel_count as usize;
            let gain_buf = read_exact(t, cmd, gain_len)?;
            let threshold_buf = read_exact(t, cmd, gain_len + 2)?;
            let mut snapshot = ReadoutSnapshot::decode(channel_count, &gain_buf, &threshold_buf)?;

            let trailer = t.read_up_to(TRAILER_LEN)?;
            if trailer.get(TRAILER_EOT_INDEX) != Some(&EOT) {
                tracing::warn!(
                    "{}: no end of transmission received (trailer {:02x?})",
                    self.port,
                    trailer
                );
                snapshot.eot_received = false;
            }
            Ok(snapshot)
        })
    }

    /// Toggle the board's status LED. The board sends nothing back.
    pub fn toggle_led(&self) -> Result<(), ProtocolError> {
        let cmd = Command::ToggleLed;
        self.run(cmd.name(), self.timings.led, |t| self.exchange(t, cmd))
    }

    /// Send `cmd` and wait for whatever acknowledgement it calls for
    fn exchange(&self, t: &mut dyn Transport, cmd: Command) -> Result<(), ProtocolError> {
        t.write_all(&cmd.to_bytes())?;
        self.acknowledge(t, cmd)
    }

    /// Consume the ACK for `cmd`.
    ///
    /// Slow commands are polled until their deadline, other acknowledged
    /// commands must answer on the next read, the rest read nothing.
    fn acknowledge(&self, t: &mut dyn Transport, cmd: Command) -> Result<(), ProtocolError> {
        if cmd.polls_for_ack() {
            wait_for_ack(
                t,
                cmd,
                self.timings.ack_deadline(cmd),
                self.timings.poll_interval,
                &self.cancel,
            )
        } else if cmd.expects_ack() {
            expect_ack(cmd, t.read_byte()?)
        } else {
            Ok(())
        }
    }
}

/// An open connection used to write channel values
pub struct Link<'s> {
    session: &'s BoardSession,
    transport: Box<dyn Transport>,
    channel_count: u8,
}

impl Link<'_> {
    /// Set one channel's gain. The channel is sent through the pair swap.
    pub fn set_gain(&mut self, channel: u8, value: u16) -> Result<(), ProtocolError> {
        self.set_value(ValueKind::Gain, channel, value)
    }

    /// Set one channel's threshold
    pub fn set_threshold(&mut self, channel: u8, value: u16) -> Result<(), ProtocolError> {
        self.set_value(ValueKind::Threshold, channel, value)
    }

    /// Send one set command and require a single ACK.
    ///
    /// `value` is expected to fit in 12 bits; it is not checked here.
    pub fn set_value(&mut self, kind: ValueKind, channel: u8, value: u16) -> Result<(), ProtocolError> {
        let wire_channel = match kind {
            ValueKind::Gain => swap_channel(channel, self.channel_count),
            ValueKind::Threshold => channel,
        };
        let cmd = Command::SetValue {
            kind,
            wire_channel,
            value,
        };
        self.session.exchange(self.transport.as_mut(), cmd)
    }

    /// Push the pending values to the DAC and close the connection.
    ///
    /// Polls until the board sends ACK, the commit deadline passes or the
    /// session is cancelled.
    pub fn commit_to_dac(mut self) -> Result<(), ProtocolError> {
        tracing::info!("Applying values to DAC on {}: waiting for ACK", self.session.port);
        self.session
            .exchange(self.transport.as_mut(), Command::WriteValues)?;
        tracing::info!("Applying values to DAC on {}: ACK received", self.session.port);
        Ok(())
    }
}

/// Check that `received` is ACK
fn expect_ack(cmd: Command, received: Option<u8>) -> Result<(), ProtocolError> {
    match received {
        Some(ACK) => Ok(()),
        Some(byte) => {
            tracing::debug!("{}: expected ACK, got {}", cmd.name(), describe_byte(byte));
            Err(ProtocolError::NoAck {
                command: cmd.name(),
                received: byte,
            })
        }
        None => Err(ProtocolError::MissingResponse {
            command: cmd.name(),
        }),
    }
}

/// Read exactly `n` bytes or fail with a short read
fn read_exact(t: &mut dyn Transport, cmd: Command, n: usize) -> Result<Vec<u8>, ProtocolError> {
    let buf = t.read_up_to(n)?;
    if buf.len() < n {
        return Err(ProtocolError::ShortRead {
            command: cmd.name(),
            expected: n,
            actual: buf.len(),
        });
    }
    Ok(buf)
}

/// Read one byte at a time until ACK arrives.
///
/// Bytes other than ACK are discarded. Gives up once `deadline` has passed
/// or `cancel` fires.
pub fn wait_for_ack(
    t: &mut dyn Transport,
    cmd: Command,
    deadline: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), ProtocolError> {
    let start = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled {
                command: cmd.name(),
            });
        }
        match t.read_byte()? {
            Some(ACK) => return Ok(()),
            Some(byte) => tracing::debug!("{}: discarding {}", cmd.name(), describe_byte(byte)),
            None => {}
        }
        let waited = start.elapsed();
        if waited >= deadline {
            return Err(ProtocolError::TimeoutExhausted {
                command: cmd.name(),
                waited,
            });
        }
        std::thread::sleep(poll_interval);
    }
}

//! Fleet coordinator
//!
//! Runs board session operations across every discovered board, one board
//! at a time in discovery order. A failure on one board is reported in that
//! board's outcome and never stops the others; nothing is rolled back.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::board::{ApplyReport, Board, BoardOutcome, ReadoutSnapshot};
use super::discovery::{self, PortFailure};
use super::serial::list_ports;
use super::session::{BoardSession, SessionTimings};
use super::transport::PortOpener;
use super::ProtocolError;
use crate::config::AmpConfig;
use crate::settings::SettingsTable;

/// Every reachable board plus the means to talk to them
pub struct Fleet {
    opener: Arc<dyn PortOpener>,
    boards: Vec<Board>,
    timings: SessionTimings,
    cancel: CancellationToken,
}

impl Fleet {
    /// Build a fleet from boards that are already known
    pub fn new(opener: Arc<dyn PortOpener>, boards: Vec<Board>, timings: SessionTimings) -> Self {
        Self {
            opener,
            boards,
            timings,
            cancel: CancellationToken::new(),
        }
    }

    /// Identify the boards on `ports` and query their channel counts.
    ///
    /// Ports that don't identify, and boards whose channel count query fails,
    /// are returned as failures and left out of the fleet.
    pub fn discover(
        opener: Arc<dyn PortOpener>,
        ports: &[String],
        timings: SessionTimings,
    ) -> (Self, Vec<PortFailure>) {
        let report = discovery::discover_all(opener.as_ref(), ports, timings.identify);
        let mut failures = report.failures;
        let mut boards = Vec::with_capacity(report.boards.len());

        for found in report.boards {
            let session = BoardSession::new(opener.clone(), found.port.clone(), timings.clone());
            match session.get_channel_count() {
                Ok(channel_count) => {
                    tracing::info!(
                        "Board ID {:02} on {} has {} channels",
                        found.identifier,
                        found.port,
                        channel_count
                    );
                    boards.push(Board {
                        identifier: found.identifier,
                        port: found.port,
                        channel_count,
                    });
                }
                Err(error) => {
                    tracing::warn!("Couldn't get number of channels from {}: {error}", found.port);
                    failures.push(PortFailure {
                        port: found.port,
                        error,
                    });
                }
            }
        }

        (Self::new(opener, boards, timings), failures)
    }

    /// Discover boards on the host's serial ports using `config`
    pub fn discover_on_host(config: &AmpConfig) -> (Self, Vec<PortFailure>) {
        let hwid = config.hardware_id();
        let ports = discovery::list_candidate_ports(&list_ports(), hwid);
        tracing::info!("{} candidate port(s) match {}", ports.len(), hwid);
        Self::discover(Arc::new(config.serial_opener()), &ports, config.session_timings())
    }

    /// Boards in discovery order
    pub fn boards(&self) -> &[Board] {
        &self.boards
    }

    /// Number of boards
    pub fn len(&self) -> usize {
        self.boards.len()
    }

    /// True when no board was found
    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    /// Token that aborts pending commit and save polls when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A session for one of the fleet's boards
    pub fn session(&self, board: &Board) -> BoardSession {
        BoardSession::for_board(self.opener.clone(), board, self.timings.clone())
            .with_cancel(self.cancel.clone())
    }

    /// Apply the table's settings to every board that has entries in it.
    ///
    /// Boards are addressed by their position in the fleet. Boards with no
    /// entries are not contacted and have no outcome.
    pub fn apply_all(&self, settings: &SettingsTable) -> Vec<BoardOutcome<ApplyReport>> {
        let mut outcomes = Vec::new();
        for (index, board) in self.boards.iter().enumerate() {
            let entries = settings.for_board(index);
            if entries.is_empty() {
                tracing::debug!("No settings for board ID {:02}, skipped", board.identifier);
                continue;
            }
            let result = self.session(board).apply(board.channel_count, &entries);
            log_failure("apply", board, &result);
            outcomes.push(BoardOutcome {
                board: board.clone(),
                result,
            });
        }
        outcomes
    }

    /// Read every board, in discovery order
    pub fn read_all(&self) -> Vec<BoardOutcome<ReadoutSnapshot>> {
        tracing::info!("Reading values from {} board(s)", self.boards.len());
        self.for_each(|session, board| session.read_all(board.channel_count))
    }

    /// Read every board in parallel on the blocking pool.
    ///
    /// Each board still gets exactly one connection; outcomes are returned in
    /// discovery order.
    pub async fn read_all_concurrent(&self) -> Vec<BoardOutcome<ReadoutSnapshot>> {
        let handles: Vec<_> = self
            .boards
            .iter()
            .map(|board| {
                let session = self.session(board);
                let channel_count = board.channel_count;
                tokio::task::spawn_blocking(move || session.read_all(channel_count))
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (board, handle) in self.boards.iter().zip(handles) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(ProtocolError::Io(std::io::Error::other(e))),
            };
            log_failure("read", board, &result);
            outcomes.push(BoardOutcome {
                board: board.clone(),
                result,
            });
        }
        outcomes
    }

    /// Save the applied values of every board to EEPROM.
    ///
    /// Slow: each board may take around ten seconds. Only values already
    /// applied with [`Fleet::apply_all`] are saved.
    pub fn save_all(&self) -> Vec<BoardOutcome<()>> {
        self.for_each(|session, _| session.save_to_eeprom())
    }

    /// Toggle the LED on every board
    pub fn toggle_led_all(&self) -> Vec<BoardOutcome<()>> {
        self.for_each(|session, _| session.toggle_led())
    }

    fn for_each<T>(
        &self,
        op: impl Fn(&BoardSession, &Board) -> Result<T, ProtocolError>,
    ) -> Vec<BoardOutcome<T>> {
        self.boards
            .iter()
            .map(|board| {
                let result = op(&self.session(board), board);
                log_failure("operation", board, &result);
                BoardOutcome {
                    board: board.clone(),
                    result,
                }
            })
            .collect()
    }
}

fn log_failure<T>(what: &str, board: &Board, result: &Result<T, ProtocolError>) {
    if let Err(e) = result {
        tracing::warn!(
            "{what} failed on board ID {:02} ({}): {e}",
            board.identifier,
            board.port
        );
    }
}

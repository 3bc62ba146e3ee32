//! Protocol errors

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to an amplifier board
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The OS refused to open the port
    #[error("Couldn't open connection on port {port}: {reason}")]
    ConnectionFailed {
        /// Port that was being opened
        port: String,
        /// Driver's description of the failure
        reason: String,
    },

    /// The port opened but is not usable
    #[error("Port {0} is not open")]
    NotOpen(String),

    /// A byte other than ACK arrived where ACK was required
    #[error("{command}: expected ACK, got {received:#04x}")]
    NoAck {
        /// Command that was not acknowledged
        command: &'static str,
        /// Byte that arrived instead
        received: u8,
    },

    /// Nothing arrived before the read timeout
    #[error("{command}: no response from board")]
    MissingResponse {
        /// Command left unanswered
        command: &'static str,
    },

    /// Fewer bytes than the command's response length
    #[error("{command}: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Command whose response was cut short
        command: &'static str,
        /// Bytes required
        expected: usize,
        /// Bytes received
        actual: usize,
    },

    /// ACK polling ran past its deadline
    #[error("{command}: no ACK within {waited:?}")]
    TimeoutExhausted {
        /// Command whose ACK never came
        command: &'static str,
        /// Time spent polling
        waited: Duration,
    },

    /// ACK polling was cancelled by the caller
    #[error("{command}: cancelled while waiting for ACK")]
    Cancelled {
        /// Command whose ACK was being polled for
        command: &'static str,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for errors raised while acquiring the port
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionFailed { .. } | ProtocolError::NotOpen(_)
        )
    }

    /// True when the board stayed silent, either on a single read or an ACK poll
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::MissingResponse { .. }
                | ProtocolError::ShortRead { .. }
                | ProtocolError::TimeoutExhausted { .. }
        )
    }
}

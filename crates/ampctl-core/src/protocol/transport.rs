//! Byte transport abstraction
//!
//! A [`Transport`] is one open connection to one board. It is acquired per
//! operation through a [`PortOpener`] and released when dropped, so the
//! handle is freed on every exit path including early `?` returns.

use std::time::Duration;

use super::ProtocolError;

/// Raw byte I/O on one open connection
pub trait Transport: Send {
    /// Name of the port this transport is bound to
    fn port_name(&self) -> &str;

    /// Send raw bytes with no framing
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProtocolError>;

    /// Read up to `n` bytes, returning whatever arrived before the read timeout.
    ///
    /// A short (or empty) result is not an error at this layer.
    fn read_up_to(&mut self, n: usize) -> Result<Vec<u8>, ProtocolError>;

    /// Read a single byte, `None` on timeout
    fn read_byte(&mut self) -> Result<Option<u8>, ProtocolError> {
        Ok(self.read_up_to(1)?.first().copied())
    }
}

/// Opens transports by port name
pub trait PortOpener: Send + Sync {
    /// Open `port` with the given per-read timeout
    fn open(&self, port: &str, timeout: Duration) -> Result<Box<dyn Transport>, ProtocolError>;
}

impl<T: PortOpener + ?Sized> PortOpener for std::sync::Arc<T> {
    fn open(&self, port: &str, timeout: Duration) -> Result<Box<dyn Transport>, ProtocolError> {
        (**self).open(port, timeout)
    }
}

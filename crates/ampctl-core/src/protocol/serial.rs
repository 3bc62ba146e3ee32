//! Serial port handling
//!
//! Provides host port enumeration and the real serial [`Transport`].

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use super::transport::{PortOpener, Transport};
use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

impl PortInfo {
    /// Hardware id string in the `VID:PID=xxxx:xxxx` form, for USB ports
    pub fn hwid(&self) -> Option<String> {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => Some(format!("VID:PID={:04X}:{:04X}", vid, pid)),
            _ => None,
        }
    }
}

/// List all serial ports known to the OS
pub fn list_ports() -> Vec<PortInfo> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(PortInfo::from).collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate serial ports: {e}");
            Vec::new()
        }
    }
}

/// Opens real serial ports at 8N1 with no flow control
#[derive(Debug, Clone)]
pub struct SerialOpener {
    /// Baud rate
    pub baud_rate: u32,
    /// Delay after opening, for boards that reset on connect
    pub settle_after_open: Duration,
}

impl Default for SerialOpener {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            settle_after_open: Duration::ZERO,
        }
    }
}

impl PortOpener for SerialOpener {
    fn open(&self, port: &str, timeout: Duration) -> Result<Box<dyn Transport>, ProtocolError> {
        let handle = serialport::new(port, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| ProtocolError::ConnectionFailed {
                port: port.to_string(),
                reason: e.to_string(),
            })?;

        // A handle whose driver can't report its queue is not really open
        if handle.bytes_to_read().is_err() {
            return Err(ProtocolError::NotOpen(port.to_string()));
        }

        if !self.settle_after_open.is_zero() {
            std::thread::sleep(self.settle_after_open);
        }
        if let Err(e) = handle.clear(serialport::ClearBuffer::Input) {
            tracing::debug!("Couldn't clear input buffer of {port}: {e}");
        }

        tracing::debug!(
            "Opened serial port {port} ({} baud, timeout {}ms)",
            self.baud_rate,
            timeout.as_millis()
        );

        Ok(Box::new(SerialTransport {
            port_name: port.to_string(),
            port: handle,
            timeout,
        }))
    }
}

/// A [`Transport`] over an open serial port
pub struct SerialTransport {
    port_name: String,
    port: Box<dyn SerialPort>,
    timeout: Duration,
}

impl Transport for SerialTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        tracing::debug!("{} <- {:02x?}", self.port_name, bytes);
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_up_to(&mut self, n: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        let deadline = Instant::now() + self.timeout;

        while filled < n {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(k) => filled += k,
                Err(ref e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    break
                }
                Err(e) => return Err(ProtocolError::Io(e)),
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        buf.truncate(filled);
        tracing::debug!("{} -> {:02x?}", self.port_name, buf);
        Ok(buf)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        tracing::debug!("Closed serial port {}", self.port_name);
    }
}

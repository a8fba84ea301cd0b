//! Serial link implementation
//!
//! Provides the byte-level link used by the transmission controller:
//! - Port enumeration and discovery of likely printer ports
//! - 8N1 port setup without flow control
//! - Reset line (DTR) control and buffer flushing
//! - Splitting one open port into independent read and write handles

use printerlink_core::{ConnectionError, Error, Result};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Byte-level serial link
///
/// `read` returns `Ok(0)` or an error of kind `TimedOut`/`WouldBlock` when no
/// data arrived within the read timeout; both mean "idle", not failure.
pub trait SerialLink: Send {
    /// Write all bytes
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush pending output
    fn flush(&mut self) -> io::Result<()>;

    /// Read available bytes
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Drive the DTR (reset) line
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;

    /// Discard buffered input and output
    fn clear_buffers(&mut self) -> io::Result<()>;

    /// Port name
    fn name(&self) -> String;

    /// Independent handle on the same port, if the platform supports it
    fn try_split(&self) -> Option<Box<dyn SerialLink>>;
}

/// Read and write timeouts of an open link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimeouts {
    /// Bound on one read call
    pub read: Duration,
    /// Bound on one write call
    pub write: Duration,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_millis(500),
            write: Duration::from_millis(1000),
        }
    }
}

/// Opens links by port name
pub trait LinkOpener: Send + Sync {
    /// Open `port` at `baud`
    fn open(&self, port: &str, baud: u32, timeouts: LinkTimeouts) -> Result<Box<dyn SerialLink>>;

    /// Candidate ports for automatic selection
    fn candidates(&self) -> Vec<String>;
}

/// True for idle reads
pub fn is_idle_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

/// List serial ports that look like printer controller boards
///
/// - Windows: COM*
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    match serialport::available_ports() {
        Ok(ports) => Ok(ports
            .iter()
            .filter(|port| is_printer_port(&port.port_name))
            .map(|port| match &port.port_type {
                serialport::SerialPortType::UsbPort(usb) => SerialPortInfo {
                    port_name: port.port_name.clone(),
                    description: format!(
                        "USB {} {}",
                        usb.manufacturer.as_deref().unwrap_or("Device"),
                        usb.product.as_deref().unwrap_or("Serial Port")
                    ),
                    manufacturer: usb.manufacturer.clone(),
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                },
                _ => SerialPortInfo {
                    port_name: port.port_name.clone(),
                    description: "Serial Port".to_string(),
                    manufacturer: None,
                    vid: None,
                    pid: None,
                },
            })
            .collect()),
        Err(e) => {
            tracing::error!("Failed to enumerate serial ports: {}", e);
            Err(Error::other(format!("Failed to enumerate ports: {}", e)))
        }
    }
}

/// Check if a port name matches the usual printer board patterns
pub fn is_printer_port(port_name: &str) -> bool {
    if let Some(rest) = port_name.strip_prefix("COM") {
        return !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit());
    }

    let base = port_name.rsplit('/').next().unwrap_or(port_name);
    base.starts_with("ttyUSB")
        || base.starts_with("ttyACM")
        || base.starts_with("cu.usbserial")
        || base.starts_with("cu.usbmodem")
}

/// Serial link over a real port
pub struct RealSerialLink {
    port: Box<dyn serialport::SerialPort>,
    timeouts: LinkTimeouts,
}

impl RealSerialLink {
    /// Open a port as 8N1 without flow control
    pub fn open(port: &str, baud: u32, timeouts: LinkTimeouts) -> Result<Self> {
        let builder = serialport::new(port, baud)
            .timeout(timeouts.read)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None);

        match builder.open() {
            Ok(handle) => {
                tracing::info!("Opened serial port {} at {} baud", port, baud);
                Ok(Self {
                    port: handle,
                    timeouts,
                })
            }
            Err(e) => {
                tracing::warn!("Failed to open serial port {}: {}", port, e);
                let err = match e.kind() {
                    serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound {
                        port: port.to_string(),
                    },
                    _ => ConnectionError::FailedToOpen {
                        port: port.to_string(),
                        reason: e.to_string(),
                    },
                };
                Err(err.into())
            }
        }
    }
}

fn to_io(e: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

impl SerialLink for RealSerialLink {
    // serialport keeps a single timeout per handle; writes swap it in
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.timeouts.write == self.timeouts.read {
            return self.port.write_all(data);
        }
        self.port.set_timeout(self.timeouts.write).map_err(to_io)?;
        let written = self.port.write_all(data);
        self.port.set_timeout(self.timeouts.read).map_err(to_io)?;
        written
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.port.write_data_terminal_ready(level).map_err(to_io)
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(to_io)
    }

    fn name(&self) -> String {
        self.port.name().unwrap_or_else(|| "serial_port".to_string())
    }

    fn try_split(&self) -> Option<Box<dyn SerialLink>> {
        match self.port.try_clone() {
            Ok(port) => Some(Box::new(RealSerialLink {
                port,
                timeouts: self.timeouts,
            })),
            Err(e) => {
                tracing::warn!("Serial port cannot be split: {}", e);
                None
            }
        }
    }
}

/// Opens real serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl LinkOpener for SerialOpener {
    fn open(&self, port: &str, baud: u32, timeouts: LinkTimeouts) -> Result<Box<dyn SerialLink>> {
        Ok(Box::new(RealSerialLink::open(port, baud, timeouts)?))
    }

    fn candidates(&self) -> Vec<String> {
        list_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .unwrap_or_default()
    }
}

/// Splits received bytes into trimmed, non-empty text lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every completed line
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            if byte == b'\n' || byte == b'\r' {
                if !self.pending.is_empty() {
                    let text = String::from_utf8_lossy(&self.pending);
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        lines.push(trimmed.to_string());
                    }
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Drop any partial line
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

//! Byte-stream transports and port discovery.
//!
//! The driver talks to devices through two seams: a [`Backend`] that lists
//! and opens endpoints, and the [`Transport`] it hands back. The serial
//! implementation sits on the `serialport` crate; the simulator in
//! [`crate::sim`] implements the same traits in memory.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::debug;
use serde::Serialize;
use serialport::{DataBits, Parity, SerialPort, SerialPortType, StopBits};

use crate::config::DriverConfig;
use crate::errors::Result;

/// Trait for Read + Write + Send, plus a count of bytes ready to be read
/// without blocking.
pub trait Transport: Read + Write + Send {
    fn bytes_available(&mut self) -> io::Result<usize>;
}

/// A discovered endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

impl PortInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

impl std::fmt::Display for PortInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.description)
    }
}

/// Enumerates and opens endpoints.
pub trait Backend {
    fn available_ports(&self) -> Result<Vec<PortInfo>>;
    fn open(&self, port: &str) -> Result<Box<dyn Transport>>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn available_ports(&self) -> Result<Vec<PortInfo>> {
        (**self).available_ports()
    }

    fn open(&self, port: &str) -> Result<Box<dyn Transport>> {
        (**self).open(port)
    }
}

// ============================================================================
// Serial backend
// ============================================================================

/// Backend over the host's serial ports (8N1).
#[derive(Debug, Clone)]
pub struct SerialBackend {
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl SerialBackend {
    pub fn new(baud_rate: u32, timeout: Duration) -> Self {
        Self { baud_rate, timeout }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(config.baud_rate, config.io_timeout())
    }
}

impl Default for SerialBackend {
    fn default() -> Self {
        Self::from_config(&DriverConfig::default())
    }
}

fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(info) => {
            let parts: Vec<&str> = [info.manufacturer.as_deref(), info.product.as_deref()]
                .into_iter()
                .flatten()
                .collect();
            if parts.is_empty() {
                format!("USB Serial ({:04x}:{:04x})", info.vid, info.pid)
            } else {
                parts.join(" ")
            }
        }
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::Unknown => "n/a".to_string(),
    }
}

impl Backend for SerialBackend {
    fn available_ports(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|p| {
                let description = describe(&p.port_type);
                PortInfo::new(p.port_name, description)
            })
            .collect())
    }

    fn open(&self, port: &str) -> Result<Box<dyn Transport>> {
        debug!("opening serial port: port={}, baud={}", port, self.baud_rate);
        let port = serialport::new(port, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(self.timeout)
            .open()?;
        Ok(Box::new(SerialTransport { port }))
    }
}

/// An open serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialTransport {
    fn bytes_available(&mut self) -> io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_non_usb_ports_by_type() {
        assert_eq!(describe(&SerialPortType::BluetoothPort), "Bluetooth");
        assert_eq!(describe(&SerialPortType::PciPort), "PCI");
        assert_eq!(describe(&SerialPortType::Unknown), "n/a");
    }

    #[test]
    fn port_info_displays_like_the_port_list() {
        let info = PortInfo::new("/dev/ttyACM0", "Arduino Uno");
        assert_eq!(info.to_string(), "/dev/ttyACM0: Arduino Uno");
    }
}

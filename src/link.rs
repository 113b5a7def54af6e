//! Byte-level access to an attached device.
//!
//! The protocol is strictly one byte out, one echo back, so the link is
//! modeled at that granularity rather than as a stream.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort, SerialPortType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("read timed out")]
    Timeout,
    #[error("failed to open port '{port}': {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// An exclusive byte link to one device.
pub trait Connection: Send {
    fn write_byte(&mut self, byte: u8) -> Result<(), LinkError>;

    /// Blocks up to the configured timeout for one byte.
    fn read_byte(&mut self) -> Result<u8, LinkError>;

    /// Discards anything buffered in either direction.
    fn purge(&mut self) -> Result<(), LinkError>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), LinkError>;

    /// Reads exactly `len` bytes.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, LinkError> {
        (0..len).map(|_| self.read_byte()).collect()
    }
}

/// Opens connections by port name.
pub trait Connector: Send + 'static {
    fn open(&self, port: &str) -> Result<Box<dyn Connection>, LinkError>;
}

/// A [`Connection`] over a physical serial port.
pub struct SerialConnection {
    port: Box<dyn SerialPort>,
}

impl SerialConnection {
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self, LinkError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|source| LinkError::Open {
                port: port_name.to_owned(),
                source,
            })?;
        Ok(Self { port })
    }
}

impl Connection for SerialConnection {
    fn write_byte(&mut self, byte: u8) -> Result<(), LinkError> {
        self.port.write_all(&[byte])?;
        self.port.flush()?;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, LinkError> {
        let mut buf = [0u8; 1];
        match self.port.read_exact(&mut buf) {
            Ok(()) => Ok(buf[0]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(LinkError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn purge(&mut self) -> Result<(), LinkError> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), LinkError> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }
}

/// Opens [`SerialConnection`]s at a fixed baud rate.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl Connector for SerialConnector {
    fn open(&self, port: &str) -> Result<Box<dyn Connection>, LinkError> {
        let connection = SerialConnection::open(port, self.baud_rate, self.timeout)?;
        Ok(Box::new(connection))
    }
}

/// A serial port visible on this machine.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

pub fn available_ports() -> Result<Vec<PortInfo>, LinkError> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let description = match p.port_type {
                SerialPortType::UsbPort(usb) => format!(
                    "USB {:04x}:{:04x} {}",
                    usb.vid,
                    usb.pid,
                    usb.product.unwrap_or_default()
                ),
                SerialPortType::PciPort => "PCI".to_owned(),
                SerialPortType::BluetoothPort => "Bluetooth".to_owned(),
                SerialPortType::Unknown => String::new(),
            };
            PortInfo {
                name: p.port_name,
                description,
            }
        })
        .collect())
}

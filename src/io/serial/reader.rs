// src/io/serial/reader.rs
//
// Serial port transport for the cable and virtual COM paths, plus adapter
// enumeration. The port is opened with a short read timeout so the frame
// reader can poll it while the distributor writes through the same handle.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use super::utils::{self, Parity};
use crate::io::{AdapterInfo, IoError, Transport, TransportKind};
use crate::tlog;

// ============================================================================
// Types and Configuration
// ============================================================================

/// Serial port configuration
#[derive(Clone, Debug)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub read_timeout: Duration,
}

impl SerialConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            read_timeout: Duration::from_millis(5),
        }
    }
}

// ============================================================================
// Serial Transport
// ============================================================================

pub struct SerialTransport {
    config: SerialConfig,
    kind: TransportKind,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig, kind: TransportKind) -> Self {
        Self {
            config,
            kind,
            port: None,
        }
    }

    fn device(&self) -> String {
        format!("{}({})", self.kind, self.config.port)
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), IoError> {
        self.config.read_timeout = timeout;
        let device = self.device();
        if let Some(port) = self.port.as_mut() {
            port.set_timeout(timeout)
                .map_err(|e| IoError::protocol(&device, format!("set read timeout: {}", e)))?;
        }
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), IoError> {
        if self.port.is_some() {
            return Ok(());
        }
        let device = self.device();
        let port = serialport::new(&self.config.port, self.config.baud_rate)
            .data_bits(utils::to_serialport_data_bits(self.config.data_bits))
            .stop_bits(utils::to_serialport_stop_bits(self.config.stop_bits))
            .parity(utils::to_serialport_parity(&self.config.parity))
            .timeout(self.config.read_timeout)
            .open()
            .map_err(|e| IoError::connection(&device, e.to_string()))?;

        tlog!(
            "[serial] Opened {} at {} baud ({}-{}-{}) as {}",
            self.config.port,
            self.config.baud_rate,
            self.config.data_bits,
            utils::parity_label(&self.config.parity),
            self.config.stop_bits,
            self.kind
        );
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tlog!("[serial] Closed {}", self.config.port);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let device = self.device();
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| IoError::not_connected(&device))?;
        match port.read(buf) {
            Ok(0) => Err(IoError::read(&device, "port disconnected")),
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(IoError::read(&device, e.to_string())),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), IoError> {
        let device = self.device();
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| IoError::not_connected(&device))?;
        port.write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| IoError::write(&device, e.to_string()))
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn port_name(&self) -> &str {
        &self.config.port
    }

    fn clear_input(&mut self) -> Result<(), IoError> {
        let device = self.device();
        if let Some(port) = self.port.as_mut() {
            port.clear(serialport::ClearBuffer::Input)
                .map_err(|e| IoError::protocol(&device, format!("clear input: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Adapter Enumeration
// ============================================================================

/// List available serial ports as adapter candidates.
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
/// The tty (terminal) devices block on open waiting for carrier detect.
pub fn list_serial_ports() -> Result<Vec<AdapterInfo>, IoError> {
    let ports = serialport::available_ports()
        .map_err(|e| IoError::connection("serial", format!("Failed to enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| match p.port_type {
            serialport::SerialPortType::UsbPort(info) => AdapterInfo {
                port_name: p.port_name,
                description: info
                    .product
                    .or(info.manufacturer)
                    .unwrap_or_default(),
                serial_number: info.serial_number,
                vid: Some(info.vid),
                pid: Some(info.pid),
            },
            _ => AdapterInfo {
                port_name: p.port_name,
                ..AdapterInfo::default()
            },
        })
        .collect())
}

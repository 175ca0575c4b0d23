// src/io/mod.rs
//
// Transport abstraction for the Neuromaster link.
// A transport is a byte-oriented duplex channel; the serial driver covers the
// cable and virtual COM paths, the XBee driver wraps a serial port for the
// radio path. The TCP fan-out server lives here too since it is the
// downstream side of the same I/O layer.

mod error;
pub mod serial;
pub mod tcp;
mod types;
pub mod xbee;

#[cfg(test)]
pub(crate) mod mock;

pub use error::IoError;
pub use types::{AdapterInfo, ConnectionDescriptor, TransportKind};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::tlog;

// ============================================================================
// Time
// ============================================================================

/// Get current time in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Byte-oriented duplex channel to the device.
///
/// `read` returns `Ok(0)` when nothing arrived within the read timeout; a
/// vanished link is reported as an error so the caller can tear down.
pub trait Transport: Send {
    fn open(&mut self) -> Result<(), IoError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError>;
    fn write(&mut self, data: &[u8]) -> Result<(), IoError>;
    fn kind(&self) -> TransportKind;
    fn port_name(&self) -> &str;

    /// Put the far side into low power before the link is released.
    /// Only the radio path has anything to do here.
    fn enter_low_power(&mut self) -> Result<(), IoError> {
        Ok(())
    }

    /// Discard anything buffered on the receive side.
    fn clear_input(&mut self) -> Result<(), IoError> {
        Ok(())
    }

    /// Send `request` and wait up to `timeout` for `expected` to appear in the
    /// reply stream. Leading noise before the reply is tolerated.
    fn probe(&mut self, request: &[u8], expected: &[u8], timeout: Duration) -> Result<bool, IoError> {
        self.clear_input()?;
        self.write(request)?;
        if expected.is_empty() {
            return Ok(true);
        }

        let deadline = Instant::now() + timeout;
        let mut received: Vec<u8> = Vec::with_capacity(64);
        let mut buf = [0u8; 64];

        while Instant::now() < deadline {
            let n = self.read(&mut buf)?;
            if n == 0 {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            received.extend_from_slice(&buf[..n]);
            if received.windows(expected.len()).any(|w| w == expected) {
                return Ok(true);
            }
        }

        tlog!(
            "[probe] {} ({}): no signature within {:?}, got [{}]",
            self.port_name(),
            self.kind(),
            timeout,
            hex::encode(&received)
        );
        Ok(false)
    }
}

/// Transport shared between the reader thread (reads) and the distributor (writes)
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

pub fn share(transport: Box<dyn Transport>) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

/// Human-readable device label used in error messages
pub fn device_label(transport: &dyn Transport) -> String {
    format!("{}({})", transport.kind(), transport.port_name())
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[test]
    fn test_probe_finds_signature_after_noise() {
        let (mut t, handle) = MockTransport::new(TransportKind::Cable, "mock0");
        handle.respond_to(vec![0x01, 0x02], vec![0xAA, 0x55, 0x10, 0x20]);
        t.open().unwrap();
        assert!(t.probe(&[0x01, 0x02], &[0x10, 0x20], Duration::from_millis(100)).unwrap());
        assert_eq!(handle.written(), vec![vec![0x01, 0x02]]);
    }

    #[test]
    fn test_probe_times_out_without_reply() {
        let (mut t, _handle) = MockTransport::new(TransportKind::Cable, "mock0");
        t.open().unwrap();
        assert!(!t.probe(&[0x01], &[0x10], Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn test_probe_on_closed_transport_fails() {
        let (mut t, _handle) = MockTransport::new(TransportKind::Radio, "mock1");
        let err = t.probe(&[0x01], &[0x10], Duration::from_millis(20)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_device_label() {
        let (t, _handle) = MockTransport::new(TransportKind::Radio, "COM9");
        assert_eq!(device_label(&t), "radio(COM9)");
    }

    #[test]
    fn test_now_us_is_recent() {
        // 2020-01-01 in microseconds
        assert!(now_us() > 1_577_836_800_000_000);
    }
}

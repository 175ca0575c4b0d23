// src/io/error.rs
//
// Error type shared by the transports, the frame codecs and the distributor.
// Helpers take a device label (e.g. "serial(/dev/ttyUSB0)") so messages say
// which link failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("{device}: connection failed: {message}")]
    Connection { device: String, message: String },

    #[error("{device}: timed out during {operation}")]
    Timeout { device: String, operation: String },

    #[error("{device}: read error: {message}")]
    Read { device: String, message: String },

    #[error("{device}: write error: {message}")]
    Write { device: String, message: String },

    #[error("{device}: protocol error: {message}")]
    Protocol { device: String, message: String },

    #[error("frame integrity check failed: {0}")]
    FrameIntegrity(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}: not connected")]
    NotConnected(String),
}

impl IoError {
    pub fn connection(device: &str, message: impl Into<String>) -> Self {
        IoError::Connection {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(device: &str, operation: &str) -> Self {
        IoError::Timeout {
            device: device.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn read(device: &str, message: impl Into<String>) -> Self {
        IoError::Read {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn write(device: &str, message: impl Into<String>) -> Self {
        IoError::Write {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn protocol(device: &str, message: impl Into<String>) -> Self {
        IoError::Protocol {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn frame_integrity(message: impl Into<String>) -> Self {
        IoError::FrameIntegrity(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        IoError::Decode(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        IoError::Configuration(message.into())
    }

    pub fn not_connected(device: &str) -> Self {
        IoError::NotConnected(device.to_string())
    }

    /// Errors that end the session: the link itself is gone or unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IoError::Connection { .. }
                | IoError::Read { .. }
                | IoError::Write { .. }
                | IoError::NotConnected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_device() {
        let e = IoError::timeout("serial(COM3)", "probe");
        assert_eq!(e.to_string(), "serial(COM3): timed out during probe");

        let e = IoError::connection("radio(COM4)", "access denied");
        assert_eq!(e.to_string(), "radio(COM4): connection failed: access denied");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(IoError::read("x", "gone").is_fatal());
        assert!(IoError::write("x", "gone").is_fatal());
        assert!(IoError::not_connected("x").is_fatal());
        assert!(!IoError::timeout("x", "op").is_fatal());
        assert!(!IoError::frame_integrity("bad crc").is_fatal());
        assert!(!IoError::decode("short").is_fatal());
    }
}

// src/io/types.rs
//
// Shared types describing adapters and the link that was selected.

use serde::{Deserialize, Serialize};

// ============================================================================
// Transport Kinds
// ============================================================================

/// Physical path to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    None,
    Radio,
    Cable,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::None => write!(f, "none"),
            TransportKind::Radio => write!(f, "radio"),
            TransportKind::Cable => write!(f, "cable"),
        }
    }
}

// ============================================================================
// Adapter Enumeration
// ============================================================================

/// A candidate USB-serial adapter reported by the OS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AdapterInfo {
    pub port_name: String,
    /// Product string (or manufacturer when no product is reported)
    pub description: String,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl AdapterInfo {
    /// Interface suffix of a dual-interface dongle ('A' = radio, 'B' = cable)
    pub fn interface_suffix(&self) -> Option<char> {
        self.serial_number
            .as_deref()
            .and_then(|s| s.chars().last())
            .map(|c| c.to_ascii_uppercase())
    }

    /// Serial number with the interface suffix removed
    pub fn dongle_serial(&self) -> Option<String> {
        let serial = self.serial_number.as_deref()?;
        match self.interface_suffix() {
            Some('A') | Some('B') => Some(serial[..serial.len() - 1].to_string()),
            _ => Some(serial.to_string()),
        }
    }
}

// ============================================================================
// Connection Descriptor
// ============================================================================

/// The link chosen by negotiation. Written once per negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnectionDescriptor {
    pub kind: TransportKind,
    pub port_name: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub dongle_serial: Option<String>,
}

impl ConnectionDescriptor {
    pub fn from_adapter(kind: TransportKind, adapter: &AdapterInfo) -> Self {
        Self {
            kind,
            port_name: Some(adapter.port_name.clone()),
            vid: adapter.vid,
            pid: adapter.pid,
            serial_number: adapter.serial_number.clone(),
            dongle_serial: adapter.dongle_serial(),
        }
    }
}

// src/io/serial/mod.rs
//
// Serial port driver for the cable and virtual COM paths.
//
// Features:
// - Adapter enumeration (USB description, serial number, VID/PID)
// - Short-timeout reads so the reader thread can share the port with writers
// - Neuromaster frame extraction with CRC validation

pub mod framer;
pub mod reader;
pub(crate) mod utils;

pub use framer::NeuromasterFramer;
pub use reader::{list_serial_ports, SerialConfig, SerialTransport};
pub use utils::Parity;

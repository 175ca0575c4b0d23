// src/lib.rs
//
// Neuromaster device communication engine.
//
// Data flow: transport -> reader (frames) -> distributor -> synchronizer ->
// TCP fan-out, plus typed engine events for command completions and device
// notifications. `device_scan` picks the transport; `engine` runs a session.

pub mod checksums;
pub mod device_scan;
pub mod engine;
pub mod io;
pub mod logging;
pub mod neuromaster;
pub mod settings;

pub use checksums::{Crc8, Crc8Polynomial};
pub use device_scan::{ConnectionNegotiator, ConnectionResult, NegotiationOutcome};
pub use engine::Engine;
pub use io::tcp::{ServerEvent, TcpFanoutServer};
pub use io::{ConnectionDescriptor, IoError, Transport, TransportKind};
pub use neuromaster::{CommandRequest, DataSample, EngineEvent, NeuromasterCommand};
pub use settings::EngineConfig;

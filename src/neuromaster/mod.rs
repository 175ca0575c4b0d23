// src/neuromaster/mod.rs
//
// Neuromaster device protocol: command encoding, record layouts, the inbound
// reader, the command/response distributor and the measurement synchronizer.

pub mod commands;
pub mod distributor;
pub mod receiver;
pub mod records;
pub mod synchronizer;

use chrono::NaiveDateTime;

pub use commands::{CommandRequest, DeviceToHost, ModuleCommand, NeuromasterCommand};
pub use distributor::{CommandSender, Distributor, StepOutcome};
pub use records::{BatteryStatus, DataSample, DeviceConfig, FirmwareVersion, ModuleInfo};
pub use synchronizer::{ModuleDecoder, Synchronizer};

/// Notifications raised by the distributor thread
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Every resolved command, success or failure, with "<Command>: OK|Failed"
    CommandCompleted {
        request: CommandRequest,
        status: String,
    },
    FirmwareVersion(Option<FirmwareVersion>),
    /// Whole configuration after the last fragment arrived
    ModuleConfig(Vec<ModuleInfo>),
    ModuleSpecific {
        hw_cn: u8,
        window: Vec<u8>,
    },
    DeviceClock(Option<NaiveDateTime>),
    ModuleError(u8),
    BufferFull,
    BatteryStatus(BatteryStatus),
    DeviceOffline,
    DataReady(Vec<DataSample>),
    ConnectionStatus {
        connected: bool,
        reason: String,
    },
}

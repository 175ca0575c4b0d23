// src/neuromaster/commands.rs
//
// Command codes and the outbound command request.
//
// Outbound frame: [0x0F, command, 1 + payload_len, payload..., crc8]

use std::time::Instant;

use chrono::NaiveDateTime;

use super::records::{encode_clock, ModuleInfo, MODULE_SPECIFIC_SIZE};
use crate::checksums::Crc8;
use crate::io::IoError;

// ============================================================================
// Constants
// ============================================================================

/// Lead byte of command frames and command responses
pub const COMMAND_CHANNEL: u8 = 0x0F;
/// Lead byte of device-to-host notifications
pub const DEVICE_TO_HOST_CHANNEL: u8 = 0x0E;
/// Largest payload a single command may carry
pub const MAX_PAYLOAD: usize = 250;
/// Target hardware channel meaning "none / all"
pub const BROADCAST_HW_CN: u8 = 0xFF;
/// Payload the device appends to its reply to a Connect command
pub const CONNECT_SIGNATURE: &[u8] = b"NM";

// ============================================================================
// Command Codes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NeuromasterCommand {
    None = 0x00,
    DeviceAlive = 0x01,
    Connect = 0x02,
    GetFirmwareVersion = 0x03,
    ScanModules = 0x04,
    GetModuleConfig = 0x05,
    SetModuleConfig = 0x06,
    SetConfigAllModules = 0x07,
    WrRdModuleCommand = 0x08,
    GetClock = 0x09,
    SetClock = 0x0A,
    SetConnectionClosed = 0x0B,
}

impl NeuromasterCommand {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        const ALL: [NeuromasterCommand; 12] = [
            NeuromasterCommand::None,
            NeuromasterCommand::DeviceAlive,
            NeuromasterCommand::Connect,
            NeuromasterCommand::GetFirmwareVersion,
            NeuromasterCommand::ScanModules,
            NeuromasterCommand::GetModuleConfig,
            NeuromasterCommand::SetModuleConfig,
            NeuromasterCommand::SetConfigAllModules,
            NeuromasterCommand::WrRdModuleCommand,
            NeuromasterCommand::GetClock,
            NeuromasterCommand::SetClock,
            NeuromasterCommand::SetConnectionClosed,
        ];
        ALL.get(code as usize).copied()
    }
}

/// Sub-command for `WrRdModuleCommand`, addressed to the module itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleCommand {
    None = 0x00,
    GetInfoSpecific = 0x01,
    SetInfoSpecific = 0x02,
}

/// Sub-types of device-to-host notifications (byte 1 of the frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceToHost {
    ModuleError = 0x01,
    BufferFull = 0x02,
    BatteryStatus = 0x03,
    DeviceOffline = 0x04,
}

impl DeviceToHost {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(DeviceToHost::ModuleError),
            0x02 => Some(DeviceToHost::BufferFull),
            0x03 => Some(DeviceToHost::BatteryStatus),
            0x04 => Some(DeviceToHost::DeviceOffline),
            _ => None,
        }
    }
}

// ============================================================================
// Command Request
// ============================================================================

/// One command travelling through the distributor. Only the distributor
/// mutates `response`, `success` and `deadline`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub command: NeuromasterCommand,
    pub module_command: ModuleCommand,
    pub hw_cn: u8,
    pub payload: Vec<u8>,
    pub response: Vec<u8>,
    pub success: bool,
    pub deadline: Option<Instant>,
}

impl CommandRequest {
    pub fn new(command: NeuromasterCommand, payload: Vec<u8>) -> Result<Self, IoError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(IoError::decode(format!(
                "{:?} payload is {} bytes, limit is {}",
                command,
                payload.len(),
                MAX_PAYLOAD
            )));
        }
        Ok(Self {
            command,
            module_command: ModuleCommand::None,
            hw_cn: BROADCAST_HW_CN,
            payload,
            response: Vec::new(),
            success: false,
            deadline: None,
        })
    }

    fn simple(command: NeuromasterCommand) -> Self {
        Self {
            command,
            module_command: ModuleCommand::None,
            hw_cn: BROADCAST_HW_CN,
            payload: Vec::new(),
            response: Vec::new(),
            success: false,
            deadline: None,
        }
    }

    pub fn keep_alive() -> Self {
        Self::simple(NeuromasterCommand::DeviceAlive)
    }

    pub fn connect() -> Self {
        Self::simple(NeuromasterCommand::Connect)
    }

    pub fn get_firmware_version() -> Self {
        Self::simple(NeuromasterCommand::GetFirmwareVersion)
    }

    pub fn scan_modules() -> Self {
        Self::simple(NeuromasterCommand::ScanModules)
    }

    pub fn get_clock() -> Self {
        Self::simple(NeuromasterCommand::GetClock)
    }

    pub fn set_connection_closed() -> Self {
        Self::simple(NeuromasterCommand::SetConnectionClosed)
    }

    /// Fetch the configuration fragment of one hardware channel.
    /// Requesting channel 0 starts a full configuration read.
    pub fn get_module_config(hw_cn: u8) -> Self {
        let mut req = Self::simple(NeuromasterCommand::GetModuleConfig);
        req.hw_cn = hw_cn;
        req.payload = vec![hw_cn];
        req
    }

    pub fn set_module_config(module: &ModuleInfo) -> Result<Self, IoError> {
        let mut req = Self::new(NeuromasterCommand::SetModuleConfig, module.to_bytes())?;
        req.hw_cn = module.hw_cn;
        Ok(req)
    }

    pub fn set_config_all_modules(modules: &[ModuleInfo]) -> Result<Self, IoError> {
        let payload: Vec<u8> = modules.iter().flat_map(|m| m.to_bytes()).collect();
        Self::new(NeuromasterCommand::SetConfigAllModules, payload)
    }

    pub fn set_clock(time: &NaiveDateTime) -> Self {
        let mut req = Self::simple(NeuromasterCommand::SetClock);
        req.payload = encode_clock(time).to_vec();
        req
    }

    /// Read the module-specific configuration window of one hardware channel
    pub fn get_module_specific(hw_cn: u8) -> Self {
        let mut req = Self::simple(NeuromasterCommand::WrRdModuleCommand);
        req.module_command = ModuleCommand::GetInfoSpecific;
        req.hw_cn = hw_cn;
        req.payload = vec![hw_cn, ModuleCommand::GetInfoSpecific as u8];
        req
    }

    /// Write the module-specific window; its trailing CRC is recomputed here
    pub fn set_module_specific(hw_cn: u8, window: [u8; MODULE_SPECIFIC_SIZE], crc: &Crc8) -> Self {
        let mut window = window;
        crc.seal(&mut window);
        let mut req = Self::simple(NeuromasterCommand::WrRdModuleCommand);
        req.module_command = ModuleCommand::SetInfoSpecific;
        req.hw_cn = hw_cn;
        req.payload = vec![hw_cn, ModuleCommand::SetInfoSpecific as u8];
        req.payload.extend_from_slice(&window);
        req
    }

    /// Serialise to a sealed wire frame
    pub fn encode(&self, crc: &Crc8) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.payload.len() + 4);
        frame.push(COMMAND_CHANNEL);
        frame.push(self.command.code());
        frame.push((self.payload.len() + 1) as u8);
        frame.extend_from_slice(&self.payload);
        frame.push(0);
        crc.seal(&mut frame);
        frame
    }

    /// "<Command>: OK" / "<Command>: Failed"
    pub fn status_text(&self) -> String {
        format!(
            "{:?}: {}",
            self.command,
            if self.success { "OK" } else { "Failed" }
        )
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Bytes sent to check for a device on a freshly opened link
pub fn connect_sequence(crc: &Crc8) -> Vec<u8> {
    CommandRequest::connect().encode(crc)
}

/// Reply a live device gives to `connect_sequence`
pub fn connect_reply(crc: &Crc8) -> Vec<u8> {
    let mut frame = vec![
        COMMAND_CHANNEL,
        NeuromasterCommand::Connect.code(),
        (CONNECT_SIGNATURE.len() + 1) as u8,
    ];
    frame.extend_from_slice(CONNECT_SIGNATURE);
    frame.push(0);
    crc.seal(&mut frame);
    frame
}

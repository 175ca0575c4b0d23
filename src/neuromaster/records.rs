// src/neuromaster/records.rs
//
// Fixed-layout device records: firmware version, device clock, battery
// status, per-hardware-channel module configuration, and the measurement
// sample handed downstream.
//
// All multi-byte fields are little-endian.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::io::IoError;

// ============================================================================
// Constants
// ============================================================================

pub const FIRMWARE_RECORD_SIZE: usize = 8;
pub const CLOCK_RECORD_SIZE: usize = 8;
/// Module-specific configuration window, trailing CRC included
pub const MODULE_SPECIFIC_SIZE: usize = 16;
/// Bytes per software channel inside a module config fragment
pub const SW_CHANNEL_RECORD_SIZE: usize = 12;
const FRAGMENT_HEADER_SIZE: usize = 3;

fn need(buf: &[u8], offset: usize, len: usize, what: &str) -> Result<(), IoError> {
    if buf.len() < offset + len {
        return Err(IoError::decode(format!(
            "{} needs {} bytes at offset {}, have {}",
            what,
            len,
            offset,
            buf.len()
        )));
    }
    Ok(())
}

// ============================================================================
// Firmware Version
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub hw_version: u8,
    pub major: u8,
    pub minor: u8,
    pub build: u16,
    pub release_date: Option<NaiveDate>,
}

impl FirmwareVersion {
    pub fn from_bytes(buf: &[u8], offset: usize) -> Result<Self, IoError> {
        need(buf, offset, FIRMWARE_RECORD_SIZE, "firmware version")?;
        let b = &buf[offset..offset + FIRMWARE_RECORD_SIZE];
        Ok(Self {
            hw_version: b[0],
            major: b[1],
            minor: b[2],
            build: u16::from_le_bytes([b[3], b[4]]),
            release_date: NaiveDate::from_ymd_opt(2000 + b[7] as i32, b[6] as u32, b[5] as u32),
        })
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HW{} v{}.{}.{}", self.hw_version, self.major, self.minor, self.build)?;
        if let Some(date) = self.release_date {
            write!(f, " ({})", date)?;
        }
        Ok(())
    }
}

// ============================================================================
// Device Clock
// ============================================================================

pub fn decode_clock(buf: &[u8], offset: usize) -> Result<NaiveDateTime, IoError> {
    need(buf, offset, CLOCK_RECORD_SIZE, "device clock")?;
    let b = &buf[offset..offset + CLOCK_RECORD_SIZE];
    let millis = u16::from_le_bytes([b[6], b[7]]) as u32;
    NaiveDate::from_ymd_opt(2000 + b[0] as i32, b[1] as u32, b[2] as u32)
        .and_then(|d| d.and_hms_milli_opt(b[3] as u32, b[4] as u32, b[5] as u32, millis))
        .ok_or_else(|| IoError::decode(format!("invalid device clock [{}]", hex::encode(b))))
}

pub fn encode_clock(time: &NaiveDateTime) -> [u8; CLOCK_RECORD_SIZE] {
    let year = (time.year() - 2000).clamp(0, 255) as u8;
    let millis = (time.nanosecond() / 1_000_000).min(999) as u16;
    let m = millis.to_le_bytes();
    [
        year,
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        m[0],
        m[1],
    ]
}

// ============================================================================
// Battery Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub battery_mv: u32,
    pub supply_mv: u32,
}

/// Single-cell Li-ion discharge curve, (mV, percent), ascending
const BATTERY_CURVE: [(u32, u8); 12] = [
    (3000, 0),
    (3450, 5),
    (3680, 10),
    (3740, 20),
    (3770, 30),
    (3790, 40),
    (3820, 50),
    (3870, 60),
    (3920, 70),
    (3980, 80),
    (4060, 90),
    (4200, 100),
];

impl BatteryStatus {
    /// Remaining charge estimated from the battery voltage, clamped to 0..=100
    pub fn battery_percent(&self) -> u8 {
        let mv = self.battery_mv;
        let mut lower = BATTERY_CURVE[0];
        if mv <= lower.0 {
            return lower.1;
        }
        for &upper in &BATTERY_CURVE[1..] {
            if mv <= upper.0 {
                let span = (upper.0 - lower.0) as f64;
                let frac = (mv - lower.0) as f64 / span;
                let pct = lower.1 as f64 + frac * (upper.1 - lower.1) as f64;
                return pct.round() as u8;
            }
            lower = upper;
        }
        100
    }

    /// Decode from a queued device-to-host frame `[0x0E, sub, b_lo, b_hi, s_lo, s_hi]`.
    /// Each pair is in units of 10 mV.
    pub fn from_device_frame(buf: &[u8]) -> Result<Self, IoError> {
        need(buf, 2, 4, "battery status")?;
        Ok(Self {
            battery_mv: (((buf[3] as u32) << 8) + buf[2] as u32) * 10,
            supply_mv: (((buf[5] as u32) << 8) + buf[4] as u32) * 10,
        })
    }
}

// ============================================================================
// Module Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChannelConfig {
    pub sample_interval_ms: u16,
    pub virtual_id: u32,
    /// Zero-point of the raw counts
    pub offset: i16,
    /// Resolution of one count in nano-units
    pub resolution_nv: u32,
    pub skal_max: f64,
    pub skal_min: f64,
}

impl ChannelConfig {
    /// Physical value of a raw count
    pub fn scale(&self, raw: i16) -> f64 {
        (raw as f64 - self.offset as f64) * self.resolution_nv as f64 * 1e-9
    }

    pub fn recompute_scale(&mut self) {
        self.skal_max = self.scale(i16::MAX);
        self.skal_min = self.scale(i16::MIN);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModuleInfo {
    pub hw_cn: u8,
    pub module_type: u8,
    pub sw_channels: Vec<ChannelConfig>,
    /// Last module-specific window read from the device
    pub module_specific: Option<Vec<u8>>,
}

impl ModuleInfo {
    /// Parse one fragment. Returns the module and the bytes consumed.
    pub fn parse_fragment(buf: &[u8]) -> Result<(Self, usize), IoError> {
        need(buf, 0, FRAGMENT_HEADER_SIZE, "module config header")?;
        let hw_cn = buf[0];
        let module_type = buf[1];
        let sw_count = buf[2] as usize;
        let total = FRAGMENT_HEADER_SIZE + sw_count * SW_CHANNEL_RECORD_SIZE;
        need(buf, 0, total, "module config fragment")?;

        let sw_channels = buf[FRAGMENT_HEADER_SIZE..total]
            .chunks_exact(SW_CHANNEL_RECORD_SIZE)
            .map(|c| {
                let mut ch = ChannelConfig {
                    sample_interval_ms: u16::from_le_bytes([c[0], c[1]]),
                    virtual_id: u32::from_le_bytes([c[2], c[3], c[4], c[5]]),
                    offset: i16::from_le_bytes([c[6], c[7]]),
                    resolution_nv: u32::from_le_bytes([c[8], c[9], c[10], c[11]]),
                    skal_max: 0.0,
                    skal_min: 0.0,
                };
                ch.recompute_scale();
                ch
            })
            .collect();

        Ok((
            Self {
                hw_cn,
                module_type,
                sw_channels,
                module_specific: None,
            },
            total,
        ))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            FRAGMENT_HEADER_SIZE + self.sw_channels.len() * SW_CHANNEL_RECORD_SIZE,
        );
        out.push(self.hw_cn);
        out.push(self.module_type);
        out.push(self.sw_channels.len() as u8);
        for ch in &self.sw_channels {
            out.extend_from_slice(&ch.sample_interval_ms.to_le_bytes());
            out.extend_from_slice(&ch.virtual_id.to_le_bytes());
            out.extend_from_slice(&ch.offset.to_le_bytes());
            out.extend_from_slice(&ch.resolution_nv.to_le_bytes());
        }
        out
    }
}

/// Parse the concatenated fragments of a full configuration read
pub fn parse_module_configs(buf: &[u8]) -> Result<Vec<ModuleInfo>, IoError> {
    let mut modules = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let (module, used) = ModuleInfo::parse_fragment(&buf[offset..])?;
        modules.push(module);
        offset += used;
    }
    Ok(modules)
}

/// The whole device configuration, one entry per hardware channel
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DeviceConfig {
    pub modules: Vec<ModuleInfo>,
}

impl DeviceConfig {
    pub fn module(&self, hw_cn: u8) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.hw_cn == hw_cn)
    }

    pub fn module_mut(&mut self, hw_cn: u8) -> Option<&mut ModuleInfo> {
        self.modules.iter_mut().find(|m| m.hw_cn == hw_cn)
    }

    pub fn channel(&self, hw_cn: u8, sw_cn: u8) -> Option<&ChannelConfig> {
        self.module(hw_cn)
            .and_then(|m| m.sw_channels.get(sw_cn as usize))
    }
}

// ============================================================================
// Measurement Sample
// ============================================================================

/// One measurement record. The receiver fills the wire fields; the
/// synchronizer stamps sequence, start, timestamp and virtual id; the
/// module decoder fills `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataSample {
    pub hw_cn: u8,
    pub sw_cn: u8,
    pub sync_flag: bool,
    /// Device time (ms) of the most recent sync point
    pub last_sync_ms: u32,
    /// Device time (ms) of this record relative to `last_sync_ms`
    pub offset_ms: u16,
    pub sync_sequence: u32,
    /// `last_sync_ms` of the channel's first sync record
    pub channel_started_ms: Option<u32>,
    /// Host wall-clock in microseconds since UNIX epoch
    pub timestamp_us: u64,
    pub virtual_id: u32,
    pub raw: Vec<u8>,
    pub value: Option<f64>,
}

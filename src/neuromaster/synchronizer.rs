// src/neuromaster/synchronizer.rs
//
// Per-hardware-channel sync bookkeeping. Stamps every measurement record with
// its channel's sync sequence and an absolute host timestamp, then expands
// started records into decoded samples through a module decoder.

use std::collections::HashMap;

use super::records::{ChannelConfig, DataSample, DeviceConfig};
use crate::io::now_us;

// ============================================================================
// Module Decoders
// ============================================================================

/// Expands one stamped record into zero or more samples.
pub trait ModuleDecoder: Send {
    fn decode(&self, record: &DataSample, channel: Option<&ChannelConfig>) -> Vec<DataSample>;
}

/// Default decoder: raw bytes are little-endian i16 counts, one sample each,
/// spaced by the channel's sample interval.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScaledI16Decoder;

impl ModuleDecoder for ScaledI16Decoder {
    fn decode(&self, record: &DataSample, channel: Option<&ChannelConfig>) -> Vec<DataSample> {
        let interval_us = channel.map(|c| c.sample_interval_ms as u64 * 1000).unwrap_or(0);
        record
            .raw
            .chunks_exact(2)
            .enumerate()
            .map(|(i, pair)| {
                let count = i16::from_le_bytes([pair[0], pair[1]]);
                let mut sample = record.clone();
                sample.raw = pair.to_vec();
                sample.timestamp_us = record.timestamp_us + i as u64 * interval_us;
                sample.value = channel.map(|c| c.scale(count));
                sample
            })
            .collect()
    }
}

// ============================================================================
// Synchronizer
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ChannelSync {
    receiving_started_ms: u32,
    /// Host wall-clock when the first sync record arrived
    anchor_us: u64,
    previous_sync_ms: u32,
    counter: u32,
}

pub struct Synchronizer {
    channels: HashMap<u8, ChannelSync>,
    decoders: HashMap<u8, Box<dyn ModuleDecoder>>,
    fallback: Box<dyn ModuleDecoder>,
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Synchronizer {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            decoders: HashMap::new(),
            fallback: Box::new(ScaledI16Decoder),
        }
    }

    /// Use `decoder` for every hardware channel whose module has `module_type`
    pub fn register_decoder(&mut self, module_type: u8, decoder: Box<dyn ModuleDecoder>) {
        self.decoders.insert(module_type, decoder);
    }

    /// Forget all channel state (new session)
    pub fn reset(&mut self) {
        self.channels.clear();
    }

    pub fn sync_sequence(&self, hw_cn: u8) -> Option<u32> {
        self.channels.get(&hw_cn).map(|c| c.counter)
    }

    pub fn process(&mut self, batch: Vec<DataSample>, config: &DeviceConfig) -> Vec<DataSample> {
        self.process_at(batch, config, now_us())
    }

    /// Same as `process` with an explicit host clock, for tests
    pub fn process_at(
        &mut self,
        batch: Vec<DataSample>,
        config: &DeviceConfig,
        host_now_us: u64,
    ) -> Vec<DataSample> {
        let mut out = Vec::with_capacity(batch.len());

        for mut record in batch {
            if record.sync_flag {
                self.observe_sync(&record, host_now_us);
            }

            let Some(state) = self.channels.get(&record.hw_cn).copied() else {
                continue;
            };

            record.channel_started_ms = Some(state.receiving_started_ms);
            record.sync_sequence = state.counter;
            let device_ms = record.last_sync_ms.saturating_sub(state.receiving_started_ms) as u64
                + record.offset_ms as u64;
            record.timestamp_us = state.anchor_us + device_ms * 1000;

            let channel = config.channel(record.hw_cn, record.sw_cn);
            if let Some(ch) = channel {
                record.virtual_id = ch.virtual_id;
            }

            let decoder = config
                .module(record.hw_cn)
                .and_then(|m| self.decoders.get(&m.module_type))
                .unwrap_or(&self.fallback);
            out.extend(decoder.decode(&record, channel));
        }

        out
    }

    fn observe_sync(&mut self, record: &DataSample, host_now_us: u64) {
        match self.channels.get_mut(&record.hw_cn) {
            None => {
                self.channels.insert(
                    record.hw_cn,
                    ChannelSync {
                        receiving_started_ms: record.last_sync_ms,
                        anchor_us: host_now_us,
                        previous_sync_ms: record.last_sync_ms,
                        counter: 0,
                    },
                );
            }
            Some(state) => {
                if record.last_sync_ms != state.previous_sync_ms {
                    state.counter += 1;
                    state.previous_sync_ms = record.last_sync_ms;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neuromaster::records::ModuleInfo;

    fn record(hw_cn: u8, sync_flag: bool, last_sync_ms: u32, raw: Vec<u8>) -> DataSample {
        DataSample {
            hw_cn,
            sync_flag,
            last_sync_ms,
            raw,
            ..DataSample::default()
        }
    }

    fn config() -> DeviceConfig {
        let mut ch = ChannelConfig {
            sample_interval_ms: 2,
            virtual_id: 0x0100,
            offset: 0,
            resolution_nv: 1000,
            ..ChannelConfig::default()
        };
        ch.recompute_scale();
        DeviceConfig {
            modules: vec![ModuleInfo {
                hw_cn: 1,
                module_type: 7,
                sw_channels: vec![ch],
                module_specific: None,
            }],
        }
    }

    #[test]
    fn test_sync_sequence_counts_distinct_sync_points() {
        let mut sync = Synchronizer::new();
        let batch: Vec<DataSample> = [100, 100, 200, 200, 300]
            .iter()
            .map(|&t| record(1, true, t, vec![0, 0]))
            .collect();
        let out = sync.process_at(batch, &config(), 0);
        let seq: Vec<u32> = out.iter().map(|s| s.sync_sequence).collect();
        assert_eq!(seq, vec![0, 0, 1, 1, 2]);
        assert!(out.iter().all(|s| s.channel_started_ms == Some(100)));
    }

    #[test]
    fn test_sequence_persists_across_batches() {
        let mut sync = Synchronizer::new();
        sync.process_at(vec![record(1, true, 10, vec![])], &config(), 0);
        sync.process_at(vec![record(1, true, 20, vec![])], &config(), 0);
        assert_eq!(sync.sync_sequence(1), Some(1));
        sync.reset();
        assert_eq!(sync.sync_sequence(1), None);
    }

    #[test]
    fn test_unstarted_channel_is_skipped() {
        let mut sync = Synchronizer::new();
        let out = sync.process_at(
            vec![record(1, false, 50, vec![1, 0]), record(1, true, 60, vec![2, 0])],
            &config(),
            0,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].raw, vec![2, 0]);
    }

    #[test]
    fn test_channels_are_independent() {
        let mut sync = Synchronizer::new();
        let out = sync.process_at(
            vec![
                record(1, true, 10, vec![0, 0]),
                record(2, true, 500, vec![0, 0]),
                record(1, true, 20, vec![0, 0]),
                record(2, true, 500, vec![0, 0]),
            ],
            &config(),
            0,
        );
        let seq: Vec<(u8, u32)> = out.iter().map(|s| (s.hw_cn, s.sync_sequence)).collect();
        assert_eq!(seq, vec![(1, 0), (2, 0), (1, 1), (2, 0)]);
    }

    #[test]
    fn test_timestamp_and_scaling() {
        let mut sync = Synchronizer::new();
        let mut later = record(1, false, 1100, vec![0xE8, 0x03, 0xD0, 0x07]);
        later.offset_ms = 5;
        let out = sync.process_at(vec![record(1, true, 1000, vec![]), later], &config(), 1_000_000);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timestamp_us, 1_000_000 + 105_000);
        assert_eq!(out[1].timestamp_us, 1_000_000 + 105_000 + 2_000);
        assert_eq!(out[0].virtual_id, 0x0100);
        let v = out[0].value.unwrap();
        assert!((v - 1000.0 * 1000.0 * 1e-9).abs() < 1e-12);
    }

    struct Doubler;

    impl ModuleDecoder for Doubler {
        fn decode(&self, record: &DataSample, _channel: Option<&ChannelConfig>) -> Vec<DataSample> {
            vec![record.clone(), record.clone()]
        }
    }

    #[test]
    fn test_registered_decoder_is_used_for_module_type() {
        let mut sync = Synchronizer::new();
        sync.register_decoder(7, Box::new(Doubler));
        let out = sync.process_at(vec![record(1, true, 1, vec![])], &config(), 0);
        assert_eq!(out.len(), 2);

        // Module type unknown on HW2: default decoder, empty raw gives nothing
        let out = sync.process_at(vec![record(2, true, 1, vec![])], &config(), 0);
        assert!(out.is_empty());
    }
}

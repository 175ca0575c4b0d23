// src/neuromaster/receiver.rs
//
// Dedicated reader thread. Polls the shared transport, frames the byte
// stream, and routes each CRC-checked frame into one of three FIFO queues:
// command responses, device-to-host notifications, measurement batches.
// A transport failure is posted on a fourth queue and ends the thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::commands::{COMMAND_CHANNEL, DEVICE_TO_HOST_CHANNEL};
use super::records::DataSample;
use crate::checksums::Crc8;
use crate::io::serial::framer::{FramerStats, NeuromasterFrame, NeuromasterFramer};
use crate::io::{IoError, SharedTransport};
use crate::tlog;

// ============================================================================
// Frame Classification
// ============================================================================

/// Highest lead byte that carries measurement data (the hardware channel)
pub const MAX_HW_CHANNEL: u8 = 0x0D;
const SYNC_FLAG: u8 = 0x80;
const SW_CHANNEL_MASK: u8 = 0x0F;
/// last_sync_ms (u32) + offset_ms (u16)
const MEASUREMENT_HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `[command, payload...]`
    Response(Vec<u8>),
    /// `[0x0E, sub_type, payload...]`
    DeviceToHost(Vec<u8>),
    Measurement(DataSample),
}

pub fn classify(frame: &NeuromasterFrame) -> Result<InboundFrame, IoError> {
    let lead = frame.lead();
    let payload = frame.payload();
    match lead {
        COMMAND_CHANNEL => {
            let mut out = Vec::with_capacity(payload.len() + 1);
            out.push(frame.second());
            out.extend_from_slice(payload);
            Ok(InboundFrame::Response(out))
        }
        DEVICE_TO_HOST_CHANNEL => {
            let mut out = Vec::with_capacity(payload.len() + 2);
            out.push(DEVICE_TO_HOST_CHANNEL);
            out.push(frame.second());
            out.extend_from_slice(payload);
            Ok(InboundFrame::DeviceToHost(out))
        }
        hw_cn if hw_cn <= MAX_HW_CHANNEL => {
            if payload.len() < MEASUREMENT_HEADER_SIZE {
                return Err(IoError::decode(format!(
                    "measurement frame on HW{} has {} payload bytes",
                    hw_cn,
                    payload.len()
                )));
            }
            let b1 = frame.second();
            Ok(InboundFrame::Measurement(DataSample {
                hw_cn,
                sw_cn: b1 & SW_CHANNEL_MASK,
                sync_flag: b1 & SYNC_FLAG != 0,
                last_sync_ms: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
                offset_ms: u16::from_le_bytes([payload[4], payload[5]]),
                raw: payload[MEASUREMENT_HEADER_SIZE..].to_vec(),
                ..DataSample::default()
            }))
        }
        other => Err(IoError::frame_integrity(format!("unknown lead byte 0x{:02X}", other))),
    }
}

// ============================================================================
// Queues
// ============================================================================

/// Consumer ends of the reader's queues
pub struct ReceiverQueues {
    pub responses: Receiver<Vec<u8>>,
    pub device_to_host: Receiver<Vec<u8>>,
    pub measurements: Receiver<Vec<DataSample>>,
    pub failures: Receiver<IoError>,
}

struct QueueSenders {
    responses: Sender<Vec<u8>>,
    device_to_host: Sender<Vec<u8>>,
    measurements: Sender<Vec<DataSample>>,
    failures: Sender<IoError>,
}

fn queues() -> (QueueSenders, ReceiverQueues) {
    let (responses_tx, responses) = mpsc::channel();
    let (d2h_tx, device_to_host) = mpsc::channel();
    let (meas_tx, measurements) = mpsc::channel();
    let (fail_tx, failures) = mpsc::channel();
    (
        QueueSenders {
            responses: responses_tx,
            device_to_host: d2h_tx,
            measurements: meas_tx,
            failures: fail_tx,
        },
        ReceiverQueues {
            responses,
            device_to_host,
            measurements,
            failures,
        },
    )
}

// ============================================================================
// Reader Thread
// ============================================================================

pub struct FrameReceiver {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<FramerStats>>,
}

impl FrameReceiver {
    pub fn spawn(transport: SharedTransport, crc: Crc8) -> Result<(Self, ReceiverQueues), IoError> {
        let (senders, receivers) = queues();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop = stop_flag.clone();

        let handle = std::thread::Builder::new()
            .name("neuromaster-reader".to_string())
            .spawn(move || run_reader(transport, crc, thread_stop, senders))
            .map_err(|e| IoError::configuration(format!("spawn reader thread: {}", e)))?;

        Ok((
            Self {
                stop_flag,
                handle: Some(handle),
            },
            receivers,
        ))
    }

    /// Stop the reader and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(stats) => tlog!(
                    "[reader] Stopped ({} frames, {} crc errors, {} bytes skipped)",
                    stats.frames,
                    stats.crc_errors,
                    stats.skipped_bytes
                ),
                Err(_) => tlog!("[reader] Reader thread panicked"),
            }
        }
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_reader(
    transport: SharedTransport,
    crc: Crc8,
    stop_flag: Arc<AtomicBool>,
    tx: QueueSenders,
) -> FramerStats {
    let mut framer = NeuromasterFramer::new(crc);
    let mut buf = [0u8; 512];

    while !stop_flag.load(Ordering::Relaxed) {
        // Hold the lock only for one short-timeout read so writers get in
        let read_result = match transport.lock() {
            Ok(mut port) => port.read(&mut buf),
            Err(e) => {
                let _ = tx.failures.send(IoError::read("reader", format!("transport mutex poisoned: {}", e)));
                break;
            }
        };

        let n = match read_result {
            Ok(0) => {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            Ok(n) => n,
            Err(e) => {
                tlog!("[reader] Transport failed: {}", e);
                let _ = tx.failures.send(e);
                break;
            }
        };

        let mut batch: Vec<DataSample> = Vec::new();
        for frame in framer.feed(&buf[..n]) {
            match classify(&frame) {
                Ok(InboundFrame::Response(r)) => {
                    let _ = tx.responses.send(r);
                }
                Ok(InboundFrame::DeviceToHost(d)) => {
                    let _ = tx.device_to_host.send(d);
                }
                Ok(InboundFrame::Measurement(sample)) => batch.push(sample),
                Err(e) => tlog!("[reader] Dropping frame [{}]: {}", hex::encode(&frame.bytes), e),
            }
        }
        if !batch.is_empty() {
            let _ = tx.measurements.send(batch);
        }
    }

    framer.stats()
}

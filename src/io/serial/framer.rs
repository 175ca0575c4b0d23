// src/io/serial/framer.rs
//
// Neuromaster frame extraction from the raw serial byte stream.
//
// Every inbound frame has the shape `[lead, b1, length, payload..., crc]`
// where `length` counts payload + crc and the crc covers every preceding
// byte. Bytes that cannot start a frame, and frames whose CRC fails, are
// skipped one byte at a time until the stream resynchronises.

use crate::checksums::Crc8;

// =============================================================================
// Constants
// =============================================================================

/// Highest lead byte that can start a frame (0x0F = command channel)
pub const MAX_LEAD_BYTE: u8 = 0x0F;

/// lead + b1 + length
pub const FRAME_HEADER_LEN: usize = 3;

// =============================================================================
// Types
// =============================================================================

/// A CRC-checked frame, trailing CRC included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeuromasterFrame {
    pub bytes: Vec<u8>,
}

impl NeuromasterFrame {
    pub fn lead(&self) -> u8 {
        self.bytes[0]
    }

    pub fn second(&self) -> u8 {
        self.bytes[1]
    }

    /// Payload between the header and the CRC
    pub fn payload(&self) -> &[u8] {
        &self.bytes[FRAME_HEADER_LEN..self.bytes.len() - 1]
    }
}

/// Counters for bytes the framer had to throw away
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    pub frames: u64,
    pub crc_errors: u64,
    pub skipped_bytes: u64,
}

// =============================================================================
// Framer
// =============================================================================

/// Stateful framer for the device's inbound stream.
pub struct NeuromasterFramer {
    buffer: Vec<u8>,
    crc: Crc8,
    stats: FramerStats,
}

impl NeuromasterFramer {
    pub fn new(crc: Crc8) -> Self {
        Self {
            buffer: Vec::with_capacity(512),
            crc,
            stats: FramerStats::default(),
        }
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Feed raw bytes into the framer.
    /// Returns any complete frames whose CRC checked out.
    pub fn feed(&mut self, data: &[u8]) -> Vec<NeuromasterFrame> {
        let mut frames = Vec::new();
        self.buffer.extend_from_slice(data);

        while self.buffer.len() >= FRAME_HEADER_LEN {
            let lead = self.buffer[0];
            let length = self.buffer[2] as usize;

            if lead > MAX_LEAD_BYTE || length == 0 {
                self.buffer.remove(0);
                self.stats.skipped_bytes += 1;
                continue;
            }

            let total = FRAME_HEADER_LEN + length;
            if self.buffer.len() < total {
                break;
            }

            if self.crc.verify(&self.buffer[..total]) {
                let bytes: Vec<u8> = self.buffer.drain(..total).collect();
                self.stats.frames += 1;
                frames.push(NeuromasterFrame { bytes });
            } else {
                self.stats.crc_errors += 1;
                self.stats.skipped_bytes += 1;
                self.buffer.remove(0);
            }
        }

        frames
    }

    /// Drop any partial frame. Call when the stream ends or is restarted.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(mut body: Vec<u8>) -> Vec<u8> {
        body.push(0);
        Crc8::default().seal(&mut body);
        body
    }

    #[test]
    fn test_single_frame() {
        let mut framer = NeuromasterFramer::new(Crc8::default());
        let frame = sealed(vec![0x0F, 0x03, 0x03, 0xAA, 0xBB]);
        let frames = framer.feed(&frame);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes, frame);
        assert_eq!(frames[0].payload(), &[0xAA, 0xBB]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut framer = NeuromasterFramer::new(Crc8::default());
        let frame = sealed(vec![0x0E, 0x03, 0x05, 0x10, 0x20, 0x30, 0x40]);
        assert!(framer.feed(&frame[..4]).is_empty());
        assert_eq!(framer.pending(), 4);
        let frames = framer.feed(&frame[4..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].lead(), 0x0E);
        assert_eq!(frames[0].second(), 0x03);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut framer = NeuromasterFramer::new(Crc8::default());
        let mut stream = sealed(vec![0x02, 0x81, 0x01]);
        stream.extend(sealed(vec![0x0F, 0x01, 0x01]));
        let frames = framer.feed(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].lead(), 0x02);
        assert_eq!(frames[1].lead(), 0x0F);
    }

    #[test]
    fn test_corrupted_frame_is_dropped_and_stream_resyncs() {
        let crc = Crc8::default();
        let mut framer = NeuromasterFramer::new(crc.clone());

        // Bytes after the lead are all > 0x0F so resync walks straight to `good`
        let mut bad = vec![0x0F, 0x20, 0x10];
        bad.extend([0x40; 15]);
        let correct = crc.checksum(&bad);
        let wrong = (0x10..=0xFFu8).find(|&b| b != correct).unwrap();
        bad.push(wrong);
        let good = sealed(vec![0x0F, 0x09, 0x02, 0x66]);

        let mut stream = bad;
        stream.extend_from_slice(&good);
        let frames = framer.feed(&stream);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes, good);
        assert_eq!(framer.stats().crc_errors, 1);
        assert_eq!(framer.stats().skipped_bytes, 19);
    }

    #[test]
    fn test_noise_before_frame_is_skipped() {
        let mut framer = NeuromasterFramer::new(Crc8::default());
        let good = sealed(vec![0x0F, 0x01, 0x01]);
        let mut stream = vec![0xFF, 0x7E, 0x80];
        stream.extend_from_slice(&good);
        let frames = framer.feed(&stream);
        assert_eq!(frames, vec![NeuromasterFrame { bytes: good }]);
        assert_eq!(framer.stats().skipped_bytes, 3);
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut framer = NeuromasterFramer::new(Crc8::default());
        framer.feed(&[0x0F, 0x01]);
        framer.reset();
        assert_eq!(framer.pending(), 0);
    }
}

// src/io/tcp/packet.rs
//
// TCP fan-out wire format.
//
// Client -> server: [packet_type u32 LE][following_length u32 LE][payload]
// Server -> client: [length u32 LE][JSON-encoded DataSample]

use crate::io::IoError;
use crate::neuromaster::DataSample;

pub const HEADER_SIZE: usize = 8;
/// Upper bound on an inbound payload; anything larger is treated as a desync
pub const MAX_PAYLOAD_LEN: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    Data = 1,
    Error = 2,
}

impl PacketType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(PacketType::Data),
            2 => Some(PacketType::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub following_length: u32,
}

impl PacketHeader {
    pub fn parse(buf: &[u8; HEADER_SIZE]) -> Result<Self, IoError> {
        let raw_type = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let following_length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let packet_type = PacketType::from_u32(raw_type)
            .ok_or_else(|| IoError::decode(format!("unknown packet type {}", raw_type)))?;
        if following_length > MAX_PAYLOAD_LEN {
            return Err(IoError::decode(format!(
                "payload length {} exceeds {}",
                following_length, MAX_PAYLOAD_LEN
            )));
        }
        Ok(Self {
            packet_type,
            following_length,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&(self.packet_type as u32).to_le_bytes());
        out[4..].copy_from_slice(&self.following_length.to_le_bytes());
        out
    }
}

/// Header plus payload, ready for the socket
pub fn encode_packet(packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
    let header = PacketHeader {
        packet_type,
        following_length: payload.len() as u32,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out
}

/// `[length u32 LE][sample JSON]`
pub fn encode_sample(sample: &DataSample) -> Result<Vec<u8>, IoError> {
    let body = serde_json::to_vec(sample)
        .map_err(|e| IoError::decode(format!("serialise sample: {}", e)))?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = PacketHeader {
            packet_type: PacketType::Error,
            following_length: 0x0102,
        };
        assert_eq!(header.encode(), [2, 0, 0, 0, 0x02, 0x01, 0, 0]);
        assert_eq!(PacketHeader::parse(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_unknown_type_and_huge_length() {
        assert!(PacketHeader::parse(&[9, 0, 0, 0, 0, 0, 0, 0]).is_err());
        let mut buf = [1u8, 0, 0, 0, 0, 0, 0, 0];
        buf[4..].copy_from_slice(&(MAX_PAYLOAD_LEN + 1).to_le_bytes());
        assert!(PacketHeader::parse(&buf).is_err());
    }

    #[test]
    fn test_sample_is_length_prefixed_json() {
        let sample = DataSample {
            hw_cn: 3,
            virtual_id: 77,
            ..DataSample::default()
        };
        let bytes = encode_sample(&sample).unwrap();
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - 4);
        let decoded: DataSample = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn test_encode_packet() {
        let packet = encode_packet(PacketType::Data, b"hi");
        assert_eq!(packet, vec![1, 0, 0, 0, 2, 0, 0, 0, b'h', b'i']);
    }
}

// src/io/xbee/codec.rs
//
// XBee API frame codec for the radio dongle.
//
// Outer frame: 0x7E, length (u16 BE, body only), body, checksum
// (0xFF - sum8(body)). In API mode 2 every byte after the start delimiter
// that collides with 0x7E/0x7D/0x11/0x13 is sent as 0x7D, byte ^ 0x20.

use crate::checksums::sum8_checksum;
use crate::io::IoError;

// =============================================================================
// Constants
// =============================================================================

pub const START_DELIMITER: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;
pub const ESCAPE_XOR: u8 = 0x20;

pub const APID_LOCAL_AT_REQUEST: u8 = 0x08;
pub const APID_REMOTE_AT_REQUEST: u8 = 0x17;
pub const APID_LOCAL_AT_RESPONSE: u8 = 0x88;
pub const APID_REMOTE_AT_RESPONSE: u8 = 0x97;

/// 16-bit address used when the destination is addressed by its 64-bit serial
pub const BROADCAST_ADDR16: u16 = 0xFFFE;

const REMOTE_OPTION_APPLY: u8 = 0x02;
const DEVICE: &str = "xbee";

/// API operating mode of the radio dongle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMode {
    /// API mode 1, no escaping
    Unescaped,
    /// API mode 2, escaped control bytes
    Escaped,
}

// =============================================================================
// AT Command Names
// =============================================================================

/// Two-character command name. Accepts either "DL" or the "ATDL" spelling.
fn at_name(command: &str) -> Result<[u8; 2], IoError> {
    let bytes = command.as_bytes();
    let name = if bytes.len() >= 4 && bytes[..2].eq_ignore_ascii_case(b"AT") {
        &bytes[2..4]
    } else {
        bytes
    };
    if name.len() != 2 {
        return Err(IoError::protocol(
            DEVICE,
            format!("invalid AT command '{}'", command),
        ));
    }
    Ok([name[0].to_ascii_uppercase(), name[1].to_ascii_uppercase()])
}

// =============================================================================
// Remote AT Command Request (0x17)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAtCommandRequest {
    pub frame_id: u8,
    destination64: u64,
    pub destination16: u16,
    pub apply_changes: bool,
    command: [u8; 2],
    pub params: Vec<u8>,
}

impl RemoteAtCommandRequest {
    pub fn new(frame_id: u8, command: &str, params: Vec<u8>) -> Result<Self, IoError> {
        Ok(Self {
            frame_id,
            destination64: 0,
            destination16: BROADCAST_ADDR16,
            apply_changes: true,
            command: at_name(command)?,
            params,
        })
    }

    /// Address the remote by its 64-bit serial number. A non-zero address
    /// forces the 16-bit address to 0xFFFE; zero leaves both unchanged.
    pub fn set_destination64(&mut self, address: u64) {
        if address != 0 {
            self.destination16 = BROADCAST_ADDR16;
            self.destination64 = address;
        }
    }

    pub fn destination64(&self) -> u64 {
        self.destination64
    }

    pub fn command(&self) -> [u8; 2] {
        self.command
    }

    /// Frame body, APID first
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(15 + self.params.len());
        body.push(APID_REMOTE_AT_REQUEST);
        body.push(self.frame_id);
        body.extend_from_slice(&self.destination64.to_be_bytes());
        body.extend_from_slice(&self.destination16.to_be_bytes());
        body.push(if self.apply_changes { REMOTE_OPTION_APPLY } else { 0x00 });
        body.extend_from_slice(&self.command);
        body.extend_from_slice(&self.params);
        body
    }

    /// A response belongs to this request when frame id and command name
    /// agree and either the 64-bit or the 16-bit address matches.
    pub fn matches(&self, response: &RemoteAtCommandResponse) -> bool {
        response.frame_id == self.frame_id
            && response.command == self.command
            && (response.source64 == self.destination64 || response.source16 == self.destination16)
    }
}

// =============================================================================
// Remote AT Command Response (0x97)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAtCommandResponse {
    pub frame_id: u8,
    pub source64: u64,
    pub source16: u16,
    pub command: [u8; 2],
    pub status: u8,
    pub data: Vec<u8>,
}

impl RemoteAtCommandResponse {
    const MIN_LEN: usize = 15;

    pub fn parse(body: &[u8]) -> Result<Self, IoError> {
        if body.len() < Self::MIN_LEN {
            return Err(IoError::protocol(
                DEVICE,
                format!("remote AT response too short: {} bytes", body.len()),
            ));
        }
        if body[0] != APID_REMOTE_AT_RESPONSE {
            return Err(IoError::protocol(
                DEVICE,
                format!("unexpected APID 0x{:02X}", body[0]),
            ));
        }
        let mut addr64 = [0u8; 8];
        addr64.copy_from_slice(&body[2..10]);
        Ok(Self {
            frame_id: body[1],
            source64: u64::from_be_bytes(addr64),
            source16: u16::from_be_bytes([body[10], body[11]]),
            command: [body[12], body[13]],
            status: body[14],
            data: body[15..].to_vec(),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

// =============================================================================
// Local AT Command (0x08)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAtCommand {
    pub frame_id: u8,
    command: [u8; 2],
    pub params: Vec<u8>,
}

impl LocalAtCommand {
    pub fn new(frame_id: u8, command: &str, params: Vec<u8>) -> Result<Self, IoError> {
        Ok(Self {
            frame_id,
            command: at_name(command)?,
            params,
        })
    }

    /// "SI": put the module to sleep immediately
    pub fn sleep_immediately(frame_id: u8) -> Self {
        Self {
            frame_id,
            command: *b"SI",
            params: Vec::new(),
        }
    }

    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + self.params.len());
        body.push(APID_LOCAL_AT_REQUEST);
        body.push(self.frame_id);
        body.extend_from_slice(&self.command);
        body.extend_from_slice(&self.params);
        body
    }
}

// =============================================================================
// Outer API Framing
// =============================================================================

fn needs_escape(byte: u8) -> bool {
    matches!(byte, START_DELIMITER | ESCAPE | XON | XOFF)
}

fn push_byte(out: &mut Vec<u8>, byte: u8, mode: ApiMode) {
    if mode == ApiMode::Escaped && needs_escape(byte) {
        out.push(ESCAPE);
        out.push(byte ^ ESCAPE_XOR);
    } else {
        out.push(byte);
    }
}

pub fn frame_checksum(body: &[u8]) -> u8 {
    0xFF - sum8_checksum(body)
}

/// Wrap a body in an API frame ready for the wire
pub fn encode_api_frame(body: &[u8], mode: ApiMode) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() * 2 + 4);
    out.push(START_DELIMITER);
    for b in (body.len() as u16).to_be_bytes() {
        push_byte(&mut out, b, mode);
    }
    for &b in body {
        push_byte(&mut out, b, mode);
    }
    push_byte(&mut out, frame_checksum(body), mode);
    out
}

/// Streaming decoder for inbound API frames.
/// Returns frame bodies whose checksum is valid; bad frames are dropped.
pub struct ApiFrameDecoder {
    mode: ApiMode,
    buffer: Vec<u8>,
    escape_next: bool,
    in_frame: bool,
    checksum_errors: u64,
}

impl ApiFrameDecoder {
    pub fn new(mode: ApiMode) -> Self {
        Self {
            mode,
            buffer: Vec::new(),
            escape_next: false,
            in_frame: false,
            checksum_errors: 0,
        }
    }

    pub fn checksum_errors(&self) -> u64 {
        self.checksum_errors
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut bodies = Vec::new();
        for &raw in data {
            if raw == START_DELIMITER {
                // Start delimiter is never escaped; it always resyncs
                self.buffer.clear();
                self.escape_next = false;
                self.in_frame = true;
                continue;
            }
            if !self.in_frame {
                continue;
            }

            let byte = if self.mode == ApiMode::Escaped {
                if raw == ESCAPE {
                    self.escape_next = true;
                    continue;
                }
                if self.escape_next {
                    self.escape_next = false;
                    raw ^ ESCAPE_XOR
                } else {
                    raw
                }
            } else {
                raw
            };
            self.buffer.push(byte);

            if self.buffer.len() >= 2 {
                let length = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
                if self.buffer.len() == length + 3 {
                    let body = &self.buffer[2..2 + length];
                    if frame_checksum(body) == self.buffer[2 + length] {
                        bodies.push(body.to_vec());
                    } else {
                        self.checksum_errors += 1;
                    }
                    self.buffer.clear();
                    self.in_frame = false;
                }
            }
        }
        bodies
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_request_body_layout() {
        let mut req = RemoteAtCommandRequest::new(0x01, "ATD0", vec![0x05]).unwrap();
        req.destination16 = 0x1234;
        req.set_destination64(0x0013_A200_4052_1234);

        assert_eq!(
            req.body(),
            vec![
                0x17, 0x01, // APID, frame id
                0x00, 0x13, 0xA2, 0x00, 0x40, 0x52, 0x12, 0x34, // addr64 BE
                0xFF, 0xFE, // addr16 forced to broadcast
                0x02, // apply changes
                b'D', b'0', 0x05,
            ]
        );
    }

    #[test]
    fn test_zero_addr64_keeps_addr16() {
        let mut req = RemoteAtCommandRequest::new(0x02, "MY", vec![]).unwrap();
        req.destination16 = 0x0042;
        req.set_destination64(0);
        assert_eq!(req.destination64(), 0);
        assert_eq!(req.destination16, 0x0042);
    }

    #[test]
    fn test_apply_changes_off() {
        let mut req = RemoteAtCommandRequest::new(0x03, "ATWR", vec![]).unwrap();
        req.apply_changes = false;
        assert_eq!(req.body()[12], 0x00);
        assert_eq!(req.command(), *b"WR");
    }

    #[test]
    fn test_invalid_command_rejected() {
        assert!(RemoteAtCommandRequest::new(0x01, "ATX", vec![]).is_err());
        assert!(LocalAtCommand::new(0x01, "", vec![]).is_err());
    }

    fn response_body(frame_id: u8, addr64: u64, addr16: u16, cmd: &[u8; 2], status: u8) -> Vec<u8> {
        let mut body = vec![APID_REMOTE_AT_RESPONSE, frame_id];
        body.extend_from_slice(&addr64.to_be_bytes());
        body.extend_from_slice(&addr16.to_be_bytes());
        body.extend_from_slice(cmd);
        body.push(status);
        body
    }

    #[test]
    fn test_response_matching() {
        let mut req = RemoteAtCommandRequest::new(0x07, "ATSL", vec![]).unwrap();
        req.set_destination64(0xAABB);

        let same = RemoteAtCommandResponse::parse(&response_body(0x07, 0xAABB, 0x0001, b"SL", 0)).unwrap();
        assert!(req.matches(&same));
        assert!(same.is_ok());

        // Matches through the 16-bit address even with a different serial
        let by16 = RemoteAtCommandResponse::parse(&response_body(0x07, 0x9999, 0xFFFE, b"SL", 0)).unwrap();
        assert!(req.matches(&by16));

        let wrong_id = RemoteAtCommandResponse::parse(&response_body(0x08, 0xAABB, 0x0001, b"SL", 0)).unwrap();
        assert!(!req.matches(&wrong_id));

        let wrong_cmd = RemoteAtCommandResponse::parse(&response_body(0x07, 0xAABB, 0x0001, b"SH", 0)).unwrap();
        assert!(!req.matches(&wrong_cmd));

        let wrong_addr = RemoteAtCommandResponse::parse(&response_body(0x07, 0x1111, 0x0001, b"SL", 0)).unwrap();
        assert!(!req.matches(&wrong_addr));
    }

    #[test]
    fn test_response_parse_rejects_short_and_foreign() {
        assert!(RemoteAtCommandResponse::parse(&[0x97, 0x01]).is_err());
        let mut body = response_body(1, 2, 3, b"SL", 0);
        body[0] = 0x88;
        assert!(RemoteAtCommandResponse::parse(&body).is_err());
    }

    #[test]
    fn test_local_sleep_command() {
        assert_eq!(LocalAtCommand::sleep_immediately(0x05).body(), vec![0x08, 0x05, b'S', b'I']);
    }

    #[test]
    fn test_api_frame_checksum() {
        // Digi reference: local AT "NJ" with frame id 0x52 -> checksum 0x0D
        let body = [0x08, 0x52, b'N', b'J'];
        let frame = encode_api_frame(&body, ApiMode::Unescaped);
        assert_eq!(frame, vec![0x7E, 0x00, 0x04, 0x08, 0x52, 0x4E, 0x4A, 0x0D]);
    }

    #[test]
    fn test_escaped_framing() {
        let body = [0x08, 0x7E, 0x11, 0x13, 0x7D];
        let frame = encode_api_frame(&body, ApiMode::Escaped);
        assert_eq!(frame[0], START_DELIMITER);
        // No raw control bytes after the delimiter
        assert!(frame[1..].iter().all(|&b| b != START_DELIMITER && b != XON && b != XOFF));

        let mut decoder = ApiFrameDecoder::new(ApiMode::Escaped);
        assert_eq!(decoder.feed(&frame), vec![body.to_vec()]);
    }

    #[test]
    fn test_decoder_drops_bad_checksum_and_resyncs() {
        let good = encode_api_frame(&[0x88, 0x01, b'S', b'I', 0x00], ApiMode::Unescaped);
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;

        let mut stream = vec![0x00, 0x01];
        stream.extend_from_slice(&bad);
        stream.extend_from_slice(&good);

        let mut decoder = ApiFrameDecoder::new(ApiMode::Unescaped);
        let bodies = decoder.feed(&stream);
        assert_eq!(bodies, vec![vec![0x88, 0x01, b'S', b'I', 0x00]]);
        assert_eq!(decoder.checksum_errors(), 1);
    }
}

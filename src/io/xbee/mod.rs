// src/io/xbee/mod.rs
//
// Radio dongle driver: XBee API framing and remote AT commands, and a
// transport that carries device traffic through the dongle.

pub mod codec;
mod transport;

pub use codec::{
    encode_api_frame, ApiFrameDecoder, ApiMode, LocalAtCommand, RemoteAtCommandRequest,
    RemoteAtCommandResponse,
};
pub use transport::XBeeTransport;

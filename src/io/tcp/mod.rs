// src/io/tcp/mod.rs
//
// TCP fan-out of decoded samples to downstream consumers.

pub mod packet;
mod server;

pub use packet::{encode_sample, PacketHeader, PacketType};
pub use server::{ServerEvent, TcpFanoutServer};

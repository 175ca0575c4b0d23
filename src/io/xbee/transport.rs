// src/io/xbee/transport.rs
//
// Radio transport. Device traffic passes through the dongle transparently;
// AT commands for the dongle itself (and its remote peer) are sent as API
// frames on the same port.

use std::time::{Duration, Instant};

use super::codec::{
    encode_api_frame, ApiFrameDecoder, ApiMode, LocalAtCommand, RemoteAtCommandRequest,
    RemoteAtCommandResponse, APID_REMOTE_AT_RESPONSE,
};
use crate::io::{device_label, IoError, Transport, TransportKind};
use crate::tlog;

pub struct XBeeTransport {
    inner: Box<dyn Transport>,
    mode: ApiMode,
    frame_id: u8,
}

impl XBeeTransport {
    /// Wrap the serial port the radio dongle is attached to
    pub fn new(inner: Box<dyn Transport>, mode: ApiMode) -> Self {
        Self {
            inner,
            mode,
            frame_id: 0,
        }
    }

    /// Next frame id. 0 tells the module not to answer, so it is skipped.
    fn next_frame_id(&mut self) -> u8 {
        self.frame_id = self.frame_id.wrapping_add(1);
        if self.frame_id == 0 {
            self.frame_id = 1;
        }
        self.frame_id
    }

    pub fn send_local_at(&mut self, command: &LocalAtCommand) -> Result<(), IoError> {
        let frame = encode_api_frame(&command.body(), self.mode);
        self.inner.write(&frame)
    }

    /// Build a remote AT request carrying a fresh frame id
    pub fn remote_request(&mut self, command: &str, params: Vec<u8>) -> Result<RemoteAtCommandRequest, IoError> {
        let frame_id = self.next_frame_id();
        RemoteAtCommandRequest::new(frame_id, command, params)
    }

    /// Send a remote AT request and wait for the matching response
    pub fn remote_at(
        &mut self,
        request: &RemoteAtCommandRequest,
        timeout: Duration,
    ) -> Result<RemoteAtCommandResponse, IoError> {
        let device = device_label(&*self);
        let frame = encode_api_frame(&request.body(), self.mode);
        self.inner.write(&frame)?;

        let mut decoder = ApiFrameDecoder::new(self.mode);
        let mut buf = [0u8; 128];
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            let n = self.inner.read(&mut buf)?;
            if n == 0 {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            for body in decoder.feed(&buf[..n]) {
                if body.first() != Some(&APID_REMOTE_AT_RESPONSE) {
                    continue;
                }
                match RemoteAtCommandResponse::parse(&body) {
                    Ok(response) if request.matches(&response) => return Ok(response),
                    Ok(_) => {}
                    Err(e) => tlog!("[xbee] {}: ignoring malformed response: {}", device, e),
                }
            }
        }

        Err(IoError::timeout(&device, "remote AT command"))
    }
}

impl Transport for XBeeTransport {
    fn open(&mut self) -> Result<(), IoError> {
        self.inner.open()
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        self.inner.read(buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.inner.write(data)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Radio
    }

    fn port_name(&self) -> &str {
        self.inner.port_name()
    }

    fn enter_low_power(&mut self) -> Result<(), IoError> {
        if !self.inner.is_open() {
            self.inner.open()?;
        }
        let frame_id = self.next_frame_id();
        self.send_local_at(&LocalAtCommand::sleep_immediately(frame_id))?;
        tlog!("[xbee] {}: sent sleep request", self.inner.port_name());
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), IoError> {
        self.inner.clear_input()
    }
}

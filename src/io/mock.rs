// src/io/mock.rs
//
// In-memory transport for unit tests. The `MockHandle` side lets a test feed
// inbound bytes, script replies to specific writes and inspect what was sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{IoError, Transport, TransportKind};

#[derive(Default)]
struct MockState {
    open: bool,
    open_error: Option<String>,
    inbound: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    responders: Vec<(Vec<u8>, Vec<u8>)>,
    low_power: bool,
    fail_reads: bool,
    fail_writes: bool,
}

pub(crate) struct MockTransport {
    kind: TransportKind,
    name: String,
    state: Arc<Mutex<MockState>>,
}

#[derive(Clone)]
pub(crate) struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn new(kind: TransportKind, name: &str) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                kind,
                name: name.to_string(),
                state: state.clone(),
            },
            MockHandle { state },
        )
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn label(&self) -> String {
        format!("{}({})", self.kind, self.name)
    }
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn push_inbound(&self, bytes: &[u8]) {
        self.lock().inbound.extend(bytes.iter().copied());
    }

    /// Every write equal to `request` queues `reply` on the inbound side
    pub(crate) fn respond_to(&self, request: Vec<u8>, reply: Vec<u8>) {
        self.lock().responders.push((request, reply));
    }

    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    pub(crate) fn clear_written(&self) {
        self.lock().written.clear();
    }

    pub(crate) fn is_open(&self) -> bool {
        self.lock().open
    }

    pub(crate) fn low_power(&self) -> bool {
        self.lock().low_power
    }

    pub(crate) fn set_open_error(&self, message: Option<&str>) {
        self.lock().open_error = message.map(str::to_string);
    }

    pub(crate) fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<(), IoError> {
        let label = self.label();
        let mut state = self.lock();
        if let Some(message) = state.open_error.clone() {
            return Err(IoError::connection(&label, message));
        }
        state.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let label = self.label();
        let mut state = self.lock();
        if !state.open {
            return Err(IoError::not_connected(&label));
        }
        if state.fail_reads {
            return Err(IoError::read(&label, "device disconnected"));
        }
        let n = buf.len().min(state.inbound.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.inbound.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), IoError> {
        let label = self.label();
        let mut state = self.lock();
        if !state.open {
            return Err(IoError::not_connected(&label));
        }
        if state.fail_writes {
            return Err(IoError::write(&label, "device disconnected"));
        }
        state.written.push(data.to_vec());
        let replies: Vec<Vec<u8>> = state
            .responders
            .iter()
            .filter(|(request, _)| request.as_slice() == data)
            .map(|(_, reply)| reply.clone())
            .collect();
        for reply in replies {
            state.inbound.extend(reply);
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn port_name(&self) -> &str {
        &self.name
    }

    fn enter_low_power(&mut self) -> Result<(), IoError> {
        self.lock().low_power = true;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), IoError> {
        self.lock().inbound.clear();
        Ok(())
    }
}

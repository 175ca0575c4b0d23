// src/engine.rs
//
// One device session: the distributor thread plus an event bridge that
// republishes decoded samples on the TCP fan-out server before handing every
// event on to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::io::tcp::TcpFanoutServer;
use crate::io::{share, IoError, Transport};
use crate::neuromaster::{CommandSender, Distributor, EngineEvent, ModuleDecoder};
use crate::settings::EngineConfig;
use crate::tlog;

pub struct Engine {
    commands: CommandSender,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    bridge: Option<JoinHandle<()>>,
}

impl Engine {
    /// Start a session on `transport` (opened here if needed). Samples are
    /// also written to `fanout` when one is given.
    pub fn start(
        transport: Box<dyn Transport>,
        config: &EngineConfig,
        fanout: Option<Arc<TcpFanoutServer>>,
    ) -> Result<(Self, Receiver<EngineEvent>), IoError> {
        Self::start_with_decoders(transport, config, fanout, Vec::new())
    }

    /// Same as `start`, registering module decoders keyed by module type
    pub fn start_with_decoders(
        mut transport: Box<dyn Transport>,
        config: &EngineConfig,
        fanout: Option<Arc<TcpFanoutServer>>,
        decoders: Vec<(u8, Box<dyn ModuleDecoder>)>,
    ) -> Result<(Self, Receiver<EngineEvent>), IoError> {
        if !transport.is_open() {
            transport.open()?;
        }

        let (internal_tx, internal_rx) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::channel();
        let (mut distributor, commands) = Distributor::start(share(transport), config, internal_tx)?;
        for (module_type, decoder) in decoders {
            distributor.synchronizer_mut().register_decoder(module_type, decoder);
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let worker = {
            let cancel = cancel.clone();
            std::thread::Builder::new()
                .name("neuromaster-distributor".to_string())
                .spawn(move || distributor.run(&cancel))
                .map_err(|e| IoError::configuration(format!("spawn distributor: {}", e)))?
        };

        let bridge = std::thread::Builder::new()
            .name("neuromaster-events".to_string())
            .spawn(move || run_bridge(internal_rx, events_tx, fanout))
            .map_err(|e| IoError::configuration(format!("spawn event bridge: {}", e)))?;

        Ok((
            Self {
                commands,
                cancel,
                worker: Some(worker),
                bridge: Some(bridge),
            },
            events_rx,
        ))
    }

    /// Handle for queueing commands; cloneable across threads
    pub fn commands(&self) -> CommandSender {
        self.commands.clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Cancel the distributor and wait for teardown to finish
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tlog!("[engine] Distributor thread panicked");
            }
        }
        if let Some(bridge) = self.bridge.take() {
            let _ = bridge.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_bridge(
    internal: Receiver<EngineEvent>,
    events: Sender<EngineEvent>,
    fanout: Option<Arc<TcpFanoutServer>>,
) {
    for event in internal {
        if let (Some(server), EngineEvent::DataReady(samples)) = (fanout.as_ref(), &event) {
            for sample in samples {
                if let Err(e) = server.write(sample) {
                    tlog!("[engine] Fan-out write failed: {}", e);
                    break;
                }
            }
        }
        // The caller may have dropped its receiver; keep feeding the fan-out
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::Crc8;
    use crate::io::mock::MockTransport;
    use crate::io::TransportKind;
    use crate::neuromaster::{CommandRequest, DataSample, NeuromasterCommand};
    use std::io::Read;
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    fn wait_for(events: &Receiver<EngineEvent>, pred: impl Fn(&EngineEvent) -> bool) -> EngineEvent {
        loop {
            let event = events.recv_timeout(Duration::from_secs(3)).unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[test]
    fn test_engine_round_trips_a_command() {
        let (mock, handle) = MockTransport::new(TransportKind::Cable, "mock");
        let crc = Crc8::default();
        let mut reply = vec![0x0F, NeuromasterCommand::ScanModules.code(), 0x01, 0x00];
        crc.seal(&mut reply);
        handle.respond_to(CommandRequest::scan_modules().encode(&crc), reply);

        let (engine, events) = Engine::start(Box::new(mock), &EngineConfig::default(), None).unwrap();
        assert!(handle.is_open());
        engine.commands().send(CommandRequest::scan_modules()).unwrap();

        let event = wait_for(&events, |e| matches!(e, EngineEvent::CommandCompleted { .. }));
        match event {
            EngineEvent::CommandCompleted { status, .. } => assert_eq!(status, "ScanModules: OK"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stop_closes_transport_and_reports() {
        let (mock, handle) = MockTransport::new(TransportKind::Radio, "mock");
        let (mut engine, events) = Engine::start(Box::new(mock), &EngineConfig::default(), None).unwrap();
        assert!(engine.is_running());
        engine.stop();
        assert!(!engine.is_running());
        assert!(!handle.is_open());
        wait_for(&events, |e| matches!(e, EngineEvent::ConnectionStatus { connected: false, .. }));
    }

    #[test]
    fn test_samples_reach_tcp_clients() {
        let (server_tx, _server_rx) = mpsc::channel();
        let server = Arc::new(
            TcpFanoutServer::start("127.0.0.1", 0, Duration::from_millis(5), 64, server_tx).unwrap(),
        );
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let start = Instant::now();
        while server.client_count() == 0 {
            assert!(start.elapsed() < Duration::from_secs(2));
            std::thread::sleep(Duration::from_millis(5));
        }

        let (mock, handle) = MockTransport::new(TransportKind::Cable, "mock");
        let (_engine, events) =
            Engine::start(Box::new(mock), &EngineConfig::default(), Some(server.clone())).unwrap();

        let mut frame = vec![0x02, 0x81, 0x09, 0x0A, 0, 0, 0, 0, 0, 0x01, 0x00, 0];
        Crc8::default().seal(&mut frame);
        handle.push_inbound(&frame);
        wait_for(&events, |e| matches!(e, EngineEvent::DataReady(_)));

        let mut len = [0u8; 4];
        client.read_exact(&mut len).unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
        client.read_exact(&mut body).unwrap();
        let sample: DataSample = serde_json::from_slice(&body).unwrap();
        assert_eq!(sample.hw_cn, 2);
        assert_eq!(sample.sw_cn, 1);
        assert_eq!(sample.raw, vec![0x01, 0x00]);
    }
}

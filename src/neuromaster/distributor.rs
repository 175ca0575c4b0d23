// src/neuromaster/distributor.rs
//
// Command/response distributor. Owns the outgoing command queue and the one
// command in flight, matches responses, enforces the command timeout, decodes
// device-to-host notifications and hands measurement batches to the
// synchronizer. Runs on its own thread; `step` is one loop iteration so tests
// can drive it with a synthetic clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};

use super::commands::{CommandRequest, DeviceToHost, ModuleCommand, NeuromasterCommand};
use super::receiver::{FrameReceiver, ReceiverQueues};
use super::records::{
    decode_clock, parse_module_configs, BatteryStatus, DeviceConfig, FirmwareVersion, ModuleInfo,
    MODULE_SPECIFIC_SIZE,
};
use super::synchronizer::Synchronizer;
use super::EngineEvent;
use crate::checksums::Crc8;
use crate::io::{device_label, IoError, SharedTransport};
use crate::settings::EngineConfig;
use crate::tlog;

// ============================================================================
// Command Handle
// ============================================================================

/// Cloneable producer side of the outgoing command queue
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<CommandRequest>,
    hw_channel_count: u8,
}

impl CommandSender {
    pub fn send(&self, request: CommandRequest) -> Result<(), IoError> {
        self.tx
            .send(request)
            .map_err(|_| IoError::not_connected("distributor"))
    }

    /// Queue one GetModuleConfig per hardware channel. The configuration is
    /// published once the last fragment has arrived.
    pub fn read_device_config(&self) -> Result<(), IoError> {
        for hw_cn in 0..self.hw_channel_count {
            self.send(CommandRequest::get_module_config(hw_cn))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// `busy` is false when the iteration found nothing to do
    Continue { busy: bool },
    Closed,
}

// ============================================================================
// Distributor
// ============================================================================

/// Aggregation of a full configuration read. Fragments arrive in HW order;
/// once one fails the rest of the read is dropped.
struct ConfigRead {
    next_hw: u8,
    total: u8,
    data: Vec<u8>,
    aborted: bool,
}

pub struct Distributor {
    transport: SharedTransport,
    device: String,
    crc: Crc8,
    receiver: Option<FrameReceiver>,
    queues: ReceiverQueues,
    outgoing: Receiver<CommandRequest>,
    pending: VecDeque<CommandRequest>,
    running: Option<CommandRequest>,
    command_timeout: Duration,
    keep_alive_interval: Duration,
    next_keep_alive: Instant,
    idle_sleep: Duration,
    hw_channel_count: u8,
    config_read: Option<ConfigRead>,
    device_config: DeviceConfig,
    synchronizer: Synchronizer,
    events: Sender<EngineEvent>,
    closed: bool,
}

impl Distributor {
    /// Start the reader thread on an opened transport and build the distributor.
    pub fn start(
        transport: SharedTransport,
        config: &EngineConfig,
        events: Sender<EngineEvent>,
    ) -> Result<(Self, CommandSender), IoError> {
        let device = transport
            .lock()
            .map(|t| device_label(&**t))
            .map_err(|_| IoError::configuration("transport mutex poisoned"))?;
        let crc = config.crc();
        let (receiver, queues) = FrameReceiver::spawn(transport.clone(), crc.clone())?;
        let (tx, outgoing) = mpsc::channel();

        let _ = events.send(EngineEvent::ConnectionStatus {
            connected: true,
            reason: format!("connected to {}", device),
        });
        tlog!("[distributor] Started on {}", device);

        Ok((
            Self {
                transport,
                device,
                crc,
                receiver: Some(receiver),
                queues,
                outgoing,
                pending: VecDeque::new(),
                running: None,
                command_timeout: config.command_timeout(),
                keep_alive_interval: config.keep_alive_interval(),
                next_keep_alive: Instant::now() + config.keep_alive_interval(),
                idle_sleep: config.idle_sleep(),
                hw_channel_count: config.hw_channel_count,
                config_read: None,
                device_config: DeviceConfig::default(),
                synchronizer: Synchronizer::new(),
                events,
                closed: false,
            },
            CommandSender {
                tx,
                hw_channel_count: config.hw_channel_count,
            },
        ))
    }

    pub fn device_config(&self) -> &DeviceConfig {
        &self.device_config
    }

    pub fn synchronizer_mut(&mut self) -> &mut Synchronizer {
        &mut self.synchronizer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Loop until cancelled or the connection ends
    pub fn run(&mut self, cancel: &AtomicBool) {
        loop {
            if cancel.load(Ordering::Relaxed) {
                self.teardown("stopped");
                break;
            }
            match self.step(Instant::now()) {
                StepOutcome::Closed => break,
                StepOutcome::Continue { busy: false } => std::thread::sleep(self.idle_sleep),
                StepOutcome::Continue { busy: true } => {}
            }
        }
    }

    /// One iteration of the protocol loop at time `now`
    pub fn step(&mut self, now: Instant) -> StepOutcome {
        if self.closed {
            return StepOutcome::Closed;
        }
        let mut busy = false;

        while let Ok(request) = self.outgoing.try_recv() {
            self.pending.push_back(request);
        }

        match self.queues.failures.try_recv() {
            Ok(e) => {
                self.teardown(&e.to_string());
                return StepOutcome::Closed;
            }
            Err(TryRecvError::Disconnected) => {
                self.teardown("reader stopped");
                return StepOutcome::Closed;
            }
            Err(TryRecvError::Empty) => {}
        }

        // Timeout first: a response still queued past the deadline is late
        let expired = self
            .running
            .as_ref()
            .and_then(|r| r.deadline)
            .is_some_and(|deadline| now >= deadline);
        if expired {
            if let Some(mut request) = self.running.take() {
                tlog!("[distributor] {:?} timed out on {}", request.command, self.device);
                request.success = false;
                request.response.clear();
                self.resolve(request);
            }
        }

        // Responses
        while let Ok(response) = self.queues.responses.try_recv() {
            busy = true;
            match self.running.take() {
                Some(mut request) if response.first() == Some(&request.command.code()) => {
                    request.response = response;
                    request.success = true;
                    self.resolve(request);
                }
                Some(request) => {
                    tlog!(
                        "[distributor] Discarding response [{}] while waiting for {:?}",
                        hex::encode(&response),
                        request.command
                    );
                    self.running = Some(request);
                }
                None => tlog!(
                    "[distributor] Discarding unsolicited response [{}]",
                    hex::encode(&response)
                ),
            }
        }

        // Device-to-host notifications
        while let Ok(frame) = self.queues.device_to_host.try_recv() {
            busy = true;
            if self.handle_device_to_host(&frame) {
                self.teardown("device offline");
                return StepOutcome::Closed;
            }
        }

        // Measurement data
        let mut batch = Vec::new();
        while let Ok(mut records) = self.queues.measurements.try_recv() {
            batch.append(&mut records);
        }
        if !batch.is_empty() {
            busy = true;
            let samples = self.synchronizer.process(batch, &self.device_config);
            self.emit(EngineEvent::DataReady(samples));
        }

        // Keep-alive only fills an otherwise empty queue; stays due until then
        if now >= self.next_keep_alive && self.pending.is_empty() && self.running.is_none() {
            self.pending.push_back(CommandRequest::keep_alive());
            self.next_keep_alive = now + self.keep_alive_interval;
        }

        // Outgoing
        if self.running.is_none() {
            if let Some(request) = self.pending.pop_front() {
                busy = true;
                if let Err(e) = self.dispatch(request, now) {
                    tlog!("[distributor] Write failed on {}: {}", self.device, e);
                    self.teardown(&e.to_string());
                    return StepOutcome::Closed;
                }
            }
        }

        StepOutcome::Continue { busy }
    }

    fn dispatch(&mut self, mut request: CommandRequest, now: Instant) -> Result<(), IoError> {
        if request.command == NeuromasterCommand::GetModuleConfig && request.hw_cn == 0 {
            self.config_read = Some(ConfigRead {
                next_hw: 0,
                total: self.hw_channel_count,
                data: Vec::new(),
                aborted: false,
            });
        }

        let frame = request.encode(&self.crc);
        let written = match self.transport.lock() {
            Ok(mut port) => port.write(&frame),
            Err(_) => Err(IoError::write(&self.device, "transport mutex poisoned")),
        };
        if let Err(e) = written {
            request.success = false;
            self.resolve(request);
            return Err(e);
        }

        request.deadline = Some(now + self.command_timeout);
        self.running = Some(request);
        Ok(())
    }

    // ========================================================================
    // Response Evaluation
    // ========================================================================

    /// Run command-specific evaluation, then report the resolution
    fn resolve(&mut self, mut request: CommandRequest) {
        if let Err(e) = self.evaluate(&mut request) {
            tlog!("[distributor] {:?} response rejected: {}", request.command, e);
            request.success = false;
        }
        let status = request.status_text();
        self.emit(EngineEvent::CommandCompleted { request, status });
    }

    fn evaluate(&mut self, request: &mut CommandRequest) -> Result<(), IoError> {
        match request.command {
            NeuromasterCommand::GetFirmwareVersion => {
                if !request.success {
                    self.emit(EngineEvent::FirmwareVersion(None));
                    return Ok(());
                }
                match FirmwareVersion::from_bytes(&request.response, 1) {
                    Ok(version) => {
                        tlog!("[distributor] Firmware {}", version);
                        self.emit(EngineEvent::FirmwareVersion(Some(version)));
                        Ok(())
                    }
                    Err(e) => {
                        self.emit(EngineEvent::FirmwareVersion(None));
                        Err(e)
                    }
                }
            }
            NeuromasterCommand::GetModuleConfig => self.collect_config_fragment(request),
            NeuromasterCommand::SetModuleConfig if request.success => {
                let (module, _) = ModuleInfo::parse_fragment(&request.payload)?;
                self.store_module(module);
                Ok(())
            }
            NeuromasterCommand::SetConfigAllModules if request.success => {
                let modules = parse_module_configs(&request.payload)?;
                self.device_config.modules = modules;
                Ok(())
            }
            NeuromasterCommand::WrRdModuleCommand if request.success => {
                self.evaluate_module_command(request)
            }
            NeuromasterCommand::GetClock => {
                if !request.success {
                    self.emit(EngineEvent::DeviceClock(None));
                    return Ok(());
                }
                match decode_clock(&request.response, 1) {
                    Ok(clock) => {
                        self.emit(EngineEvent::DeviceClock(Some(clock)));
                        Ok(())
                    }
                    Err(e) => {
                        self.emit(EngineEvent::DeviceClock(None));
                        Err(e)
                    }
                }
            }
            _ => Ok(()),
        }
    }

    fn collect_config_fragment(&mut self, request: &CommandRequest) -> Result<(), IoError> {
        let fragment = request.response.get(1..).unwrap_or_default();
        let in_read = self
            .config_read
            .as_ref()
            .is_some_and(|r| r.next_hw == request.hw_cn);

        if !in_read {
            if !request.success {
                return Ok(());
            }
            // Single-channel fetch outside a full read
            let (module, _) = ModuleInfo::parse_fragment(fragment)?;
            self.store_module(module);
            self.emit(EngineEvent::ModuleConfig(self.device_config.modules.clone()));
            return Ok(());
        }

        let Some(read) = self.config_read.as_mut() else {
            return Ok(());
        };
        read.next_hw = read.next_hw.saturating_add(1);
        if !request.success && !read.aborted {
            tlog!("[distributor] Configuration read aborted at HW{}", request.hw_cn);
            read.aborted = true;
        }
        if !read.aborted {
            read.data.extend_from_slice(fragment);
        }
        if read.next_hw < read.total {
            return Ok(());
        }

        let Some(read) = self.config_read.take() else {
            return Ok(());
        };
        if read.aborted {
            tlog!("[distributor] Incomplete configuration read dropped");
            return Ok(());
        }
        let modules = parse_module_configs(&read.data)?;
        tlog!("[distributor] Configuration read complete ({} modules)", modules.len());
        self.device_config.modules = modules;
        self.emit(EngineEvent::ModuleConfig(self.device_config.modules.clone()));
        Ok(())
    }

    fn evaluate_module_command(&mut self, request: &CommandRequest) -> Result<(), IoError> {
        match request.module_command {
            ModuleCommand::GetInfoSpecific => {
                let window = request
                    .response
                    .get(1..1 + MODULE_SPECIFIC_SIZE)
                    .ok_or_else(|| {
                        IoError::decode(format!(
                            "module specific response has {} bytes",
                            request.response.len()
                        ))
                    })?
                    .to_vec();
                if !self.crc.verify(&window) {
                    return Err(IoError::frame_integrity(format!(
                        "module specific window CRC mismatch [{}]",
                        hex::encode(&window)
                    )));
                }
                if let Some(module) = self.device_config.module_mut(request.hw_cn) {
                    module.module_specific = Some(window.clone());
                }
                self.emit(EngineEvent::ModuleSpecific {
                    hw_cn: request.hw_cn,
                    window,
                });
                Ok(())
            }
            ModuleCommand::SetInfoSpecific => {
                if let (Some(module), Some(window)) = (
                    self.device_config.module_mut(request.hw_cn),
                    request.payload.get(2..),
                ) {
                    module.module_specific = Some(window.to_vec());
                }
                Ok(())
            }
            ModuleCommand::None => Ok(()),
        }
    }

    fn store_module(&mut self, module: ModuleInfo) {
        match self.device_config.module_mut(module.hw_cn) {
            Some(existing) => {
                let specific = existing.module_specific.take();
                *existing = ModuleInfo {
                    module_specific: specific,
                    ..module
                };
            }
            None => self.device_config.modules.push(module),
        }
    }

    // ========================================================================
    // Device-to-Host
    // ========================================================================

    /// Returns true when the device announced it is going offline
    fn handle_device_to_host(&mut self, frame: &[u8]) -> bool {
        let code = frame.get(1).copied().unwrap_or(0);
        match DeviceToHost::from_code(code) {
            Some(DeviceToHost::ModuleError) => {
                if let Some(&hw_cn) = frame.get(2) {
                    tlog!("[distributor] Module error on HW{}", hw_cn);
                    self.emit(EngineEvent::ModuleError(hw_cn));
                }
            }
            Some(DeviceToHost::BufferFull) => {
                tlog!("[distributor] Device buffer full");
                self.emit(EngineEvent::BufferFull);
            }
            Some(DeviceToHost::BatteryStatus) => match BatteryStatus::from_device_frame(frame) {
                Ok(status) => {
                    tlog!(
                        "[distributor] Battery {} mV ({}%), supply {} mV",
                        status.battery_mv,
                        status.battery_percent(),
                        status.supply_mv
                    );
                    self.emit(EngineEvent::BatteryStatus(status));
                }
                Err(e) => tlog!("[distributor] Bad battery status: {}", e),
            },
            Some(DeviceToHost::DeviceOffline) => {
                tlog!("[distributor] Device went offline");
                self.emit(EngineEvent::DeviceOffline);
                return true;
            }
            None => tlog!("[distributor] Unknown device notification [{}]", hex::encode(frame)),
        }
        false
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Stop the reader, close the transport and report the disconnect.
    /// Runs once; later calls do nothing.
    fn teardown(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(mut receiver) = self.receiver.take() {
            receiver.stop();
        }
        if let Ok(mut port) = self.transport.lock() {
            port.close();
        }
        if let Some(mut request) = self.running.take() {
            request.success = false;
            request.response.clear();
            self.resolve(request);
        }
        self.pending.clear();
        self.synchronizer.reset();

        tlog!("[distributor] {} closed: {}", self.device, reason);
        self.emit(EngineEvent::ConnectionStatus {
            connected: false,
            reason: reason.to_string(),
        });
    }
}

impl Drop for Distributor {
    fn drop(&mut self) {
        self.teardown("distributor dropped");
    }
}

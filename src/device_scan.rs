// src/device_scan.rs
//
// Adapter discovery and connection negotiation.
//
// Candidate adapters are the OS serial ports whose USB description matches
// one of the configured name filters. A dual-interface Neurolink dongle shows
// up as two ports distinguished by serial-number suffix ('A' = radio,
// 'B' = cable); the cable side is probed first and the radio side is put to
// sleep when the cable answers. A single match is a legacy radio dongle.

use std::time::Duration;

use serde::Serialize;

use crate::checksums::Crc8;
use crate::io::serial::{list_serial_ports, Parity, SerialConfig, SerialTransport};
use crate::io::xbee::{ApiMode, XBeeTransport};
use crate::io::{device_label, AdapterInfo, ConnectionDescriptor, IoError, Transport, TransportKind};
use crate::neuromaster::commands::{connect_reply, connect_sequence};
use crate::settings::EngineConfig;
use crate::tlog;

// ============================================================================
// Constants
// ============================================================================

/// A dual-interface dongle enumerates as exactly this many ports
const DUAL_INTERFACE_PORTS: usize = 2;
const RADIO_SUFFIX: char = 'A';
const CABLE_SUFFIX: char = 'B';

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionResult {
    NoConnection,
    ScanError,
    NoneFound,
    Ambiguous,
    ConnectedViaRadio,
    ConnectedViaCable,
    RadioProbeError,
    CableProbeError,
    DiagnosticReadError,
}

impl ConnectionResult {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionResult::ConnectedViaRadio | ConnectionResult::ConnectedViaCable
        )
    }
}

pub struct NegotiationOutcome {
    pub result: ConnectionResult,
    pub descriptor: ConnectionDescriptor,
    /// The selected transport; every other candidate has been released
    pub transport: Option<Box<dyn Transport>>,
    pub last_error: Option<String>,
}

impl NegotiationOutcome {
    fn failed(result: ConnectionResult, error: Option<String>) -> Self {
        Self {
            result,
            descriptor: ConnectionDescriptor::default(),
            transport: None,
            last_error: error,
        }
    }

    fn selected(
        result: ConnectionResult,
        adapter: &AdapterInfo,
        kind: TransportKind,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            result,
            descriptor: ConnectionDescriptor::from_adapter(kind, adapter),
            transport: Some(transport),
            last_error: None,
        }
    }
}

// ============================================================================
// Seams
// ============================================================================

/// Source of candidate adapters
pub trait AdapterEnumerator {
    fn list(&self) -> Result<Vec<AdapterInfo>, IoError>;
}

/// OS serial-port list
pub struct SystemAdapterEnumerator;

impl AdapterEnumerator for SystemAdapterEnumerator {
    fn list(&self) -> Result<Vec<AdapterInfo>, IoError> {
        list_serial_ports()
    }
}

/// Builds (unopened) transports for a selected adapter
pub trait TransportFactory {
    fn cable(&self, adapter: &AdapterInfo) -> Box<dyn Transport>;
    fn radio(&self, adapter: &AdapterInfo) -> Box<dyn Transport>;
}

pub struct SerialTransportFactory {
    cable_baud_rate: u32,
    radio_baud_rate: u32,
    parity: Parity,
    read_timeout: Duration,
    api_mode: ApiMode,
}

impl SerialTransportFactory {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            cable_baud_rate: config.cable_baud_rate,
            radio_baud_rate: config.radio_baud_rate,
            parity: config.parity,
            read_timeout: config.read_timeout(),
            api_mode: if config.radio_api_escaped {
                ApiMode::Escaped
            } else {
                ApiMode::Unescaped
            },
        }
    }

    fn serial_config(&self, adapter: &AdapterInfo, baud_rate: u32) -> SerialConfig {
        let mut cfg = SerialConfig::new(adapter.port_name.clone(), baud_rate);
        cfg.parity = self.parity;
        cfg.read_timeout = self.read_timeout;
        cfg
    }
}

impl TransportFactory for SerialTransportFactory {
    fn cable(&self, adapter: &AdapterInfo) -> Box<dyn Transport> {
        Box::new(SerialTransport::new(
            self.serial_config(adapter, self.cable_baud_rate),
            TransportKind::Cable,
        ))
    }

    fn radio(&self, adapter: &AdapterInfo) -> Box<dyn Transport> {
        let port = SerialTransport::new(
            self.serial_config(adapter, self.radio_baud_rate),
            TransportKind::Radio,
        );
        Box::new(XBeeTransport::new(Box::new(port), self.api_mode))
    }
}

// ============================================================================
// Negotiator
// ============================================================================

pub struct ConnectionNegotiator<E: AdapterEnumerator, F: TransportFactory> {
    enumerator: E,
    factory: F,
    name_filters: Vec<String>,
    probe_timeout: Duration,
    connect_attempts: u32,
    crc: Crc8,
}

impl ConnectionNegotiator<SystemAdapterEnumerator, SerialTransportFactory> {
    /// Negotiator over the real serial ports
    pub fn system(config: &EngineConfig) -> Self {
        Self::new(SystemAdapterEnumerator, SerialTransportFactory::from_config(config), config)
    }
}

impl<E: AdapterEnumerator, F: TransportFactory> ConnectionNegotiator<E, F> {
    pub fn new(enumerator: E, factory: F, config: &EngineConfig) -> Self {
        Self {
            enumerator,
            factory,
            name_filters: config.device_name_filters.clone(),
            probe_timeout: config.probe_timeout(),
            connect_attempts: config.connect_attempts.max(1),
            crc: config.crc(),
        }
    }

    /// Adapters whose description matches a name filter
    pub fn candidates(&self) -> Result<Vec<AdapterInfo>, IoError> {
        let adapters = self.enumerator.list()?;
        Ok(adapters
            .into_iter()
            .filter(|a| self.name_filters.iter().any(|f| a.description.contains(f.as_str())))
            .collect())
    }

    /// Pick exactly one transport. Only the dual-interface path probes.
    pub fn negotiate(&self) -> NegotiationOutcome {
        let candidates = match self.candidates() {
            Ok(c) => c,
            Err(e) => {
                tlog!("[negotiator] Adapter scan failed: {}", e);
                return NegotiationOutcome::failed(ConnectionResult::ScanError, Some(e.to_string()));
            }
        };

        tlog!("[negotiator] {} candidate adapter(s)", candidates.len());
        match candidates.len() {
            0 => NegotiationOutcome::failed(ConnectionResult::NoneFound, None),
            1 => {
                let adapter = &candidates[0];
                tlog!("[negotiator] Single-interface radio dongle on {}", adapter.port_name);
                NegotiationOutcome::selected(
                    ConnectionResult::ConnectedViaRadio,
                    adapter,
                    TransportKind::Radio,
                    self.factory.radio(adapter),
                )
            }
            DUAL_INTERFACE_PORTS => self.select_dual(&candidates),
            n => {
                tlog!("[negotiator] {} matching adapters, refusing to guess", n);
                NegotiationOutcome::failed(ConnectionResult::Ambiguous, None)
            }
        }
    }

    fn select_dual(&self, candidates: &[AdapterInfo]) -> NegotiationOutcome {
        let by_suffix = |suffix: char| candidates.iter().find(|a| a.interface_suffix() == Some(suffix));
        let (Some(radio_adapter), Some(cable_adapter)) = (by_suffix(RADIO_SUFFIX), by_suffix(CABLE_SUFFIX)) else {
            return NegotiationOutcome::failed(
                ConnectionResult::ScanError,
                Some("dual-interface adapter without A/B serial suffixes".to_string()),
            );
        };

        let mut cable = self.factory.cable(cable_adapter);
        match self.probe_once(&mut *cable) {
            Ok(true) => {
                tlog!("[negotiator] Device answered on cable {}", cable_adapter.port_name);
                let mut radio = self.factory.radio(radio_adapter);
                if let Err(e) = radio.enter_low_power() {
                    tlog!("[negotiator] Could not put radio {} to sleep: {}", radio_adapter.port_name, e);
                }
                radio.close();
                return NegotiationOutcome::selected(
                    ConnectionResult::ConnectedViaCable,
                    cable_adapter,
                    TransportKind::Cable,
                    cable,
                );
            }
            Ok(false) => tlog!("[negotiator] No answer on cable {}", cable_adapter.port_name),
            Err(e) => tlog!("[negotiator] Cable probe on {} failed: {}", cable_adapter.port_name, e),
        }
        cable.close();

        NegotiationOutcome::selected(
            ConnectionResult::ConnectedViaRadio,
            radio_adapter,
            TransportKind::Radio,
            self.factory.radio(radio_adapter),
        )
    }

    fn probe_once(&self, transport: &mut dyn Transport) -> Result<bool, IoError> {
        if !transport.is_open() {
            transport.open()?;
        }
        transport.probe(
            &connect_sequence(&self.crc),
            &connect_reply(&self.crc),
            self.probe_timeout,
        )
    }

    /// Open the selected transport and confirm the device signature, retrying
    /// a bounded number of times. On failure the transport is released and
    /// the outcome downgraded to the matching probe error.
    pub fn connect(&self, outcome: &mut NegotiationOutcome) -> bool {
        let Some(transport) = outcome.transport.as_mut() else {
            return false;
        };

        let device = device_label(&**transport);
        let mut last_error: Option<String> = None;
        for attempt in 1..=self.connect_attempts {
            match self.probe_once(&mut **transport) {
                Ok(true) => {
                    tlog!("[negotiator] {} connected (attempt {})", device, attempt);
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    tlog!("[negotiator] {} attempt {} failed: {}", device, attempt, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        let kind = transport.kind();
        transport.close();
        outcome.transport = None;
        outcome.result = match kind {
            TransportKind::Cable => ConnectionResult::CableProbeError,
            _ if last_error.is_some() => ConnectionResult::DiagnosticReadError,
            _ => ConnectionResult::RadioProbeError,
        };
        outcome.last_error = last_error;
        tlog!("[negotiator] {} did not answer: {:?}", device, outcome.result);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mock::{MockHandle, MockTransport};
    use std::sync::Mutex;

    struct StaticEnumerator(Result<Vec<AdapterInfo>, String>);

    impl AdapterEnumerator for StaticEnumerator {
        fn list(&self) -> Result<Vec<AdapterInfo>, IoError> {
            self.0.clone().map_err(|e| IoError::connection("serial", e))
        }
    }

    struct MockFactory {
        cable: Mutex<Option<MockTransport>>,
        radio: Mutex<Option<MockTransport>>,
    }

    impl TransportFactory for MockFactory {
        fn cable(&self, _adapter: &AdapterInfo) -> Box<dyn Transport> {
            Box::new(self.cable.lock().unwrap().take().unwrap())
        }

        fn radio(&self, _adapter: &AdapterInfo) -> Box<dyn Transport> {
            Box::new(self.radio.lock().unwrap().take().unwrap())
        }
    }

    fn mock_factory() -> (MockFactory, MockHandle, MockHandle) {
        let (cable, cable_handle) = MockTransport::new(TransportKind::Cable, "COM4");
        let (radio, radio_handle) = MockTransport::new(TransportKind::Radio, "COM3");
        (
            MockFactory {
                cable: Mutex::new(Some(cable)),
                radio: Mutex::new(Some(radio)),
            },
            cable_handle,
            radio_handle,
        )
    }

    fn adapter(port: &str, description: &str, serial: &str) -> AdapterInfo {
        AdapterInfo {
            port_name: port.to_string(),
            description: description.to_string(),
            serial_number: Some(serial.to_string()),
            vid: Some(0x0403),
            pid: Some(0x6010),
        }
    }

    fn dual_adapters() -> Vec<AdapterInfo> {
        vec![
            adapter("COM3", "Neurolink Dual", "NL0042A"),
            adapter("COM4", "Neurolink Dual", "NL0042B"),
            adapter("COM9", "Arduino Uno", "85734323"),
        ]
    }

    fn config() -> EngineConfig {
        EngineConfig {
            probe_timeout_ms: 50,
            ..EngineConfig::default()
        }
    }

    fn answer_connect(handle: &MockHandle) {
        let crc = Crc8::default();
        handle.respond_to(connect_sequence(&crc), connect_reply(&crc));
    }

    #[test]
    fn test_cable_answer_selects_cable_and_sleeps_radio() {
        let (factory, cable, radio) = mock_factory();
        answer_connect(&cable);
        let negotiator = ConnectionNegotiator::new(StaticEnumerator(Ok(dual_adapters())), factory, &config());

        let outcome = negotiator.negotiate();
        assert_eq!(outcome.result, ConnectionResult::ConnectedViaCable);
        assert_eq!(outcome.descriptor.kind, TransportKind::Cable);
        assert_eq!(outcome.descriptor.port_name.as_deref(), Some("COM4"));
        assert_eq!(outcome.descriptor.dongle_serial.as_deref(), Some("NL0042"));
        assert!(outcome.transport.is_some());
        assert!(cable.is_open());
        assert!(radio.low_power());
        assert!(!radio.is_open());
    }

    #[test]
    fn test_silent_cable_falls_back_to_radio() {
        let (factory, cable, radio) = mock_factory();
        let negotiator = ConnectionNegotiator::new(StaticEnumerator(Ok(dual_adapters())), factory, &config());

        let outcome = negotiator.negotiate();
        assert_eq!(outcome.result, ConnectionResult::ConnectedViaRadio);
        assert_eq!(outcome.descriptor.port_name.as_deref(), Some("COM3"));
        assert!(!cable.is_open());
        assert!(!radio.low_power());
    }

    #[test]
    fn test_cable_open_error_falls_back_to_radio() {
        let (factory, cable, _radio) = mock_factory();
        cable.set_open_error(Some("access denied"));
        let negotiator = ConnectionNegotiator::new(StaticEnumerator(Ok(dual_adapters())), factory, &config());
        assert_eq!(negotiator.negotiate().result, ConnectionResult::ConnectedViaRadio);
    }

    #[test]
    fn test_three_matching_adapters_are_ambiguous() {
        let (factory, _, _) = mock_factory();
        let mut adapters = dual_adapters();
        adapters.push(adapter("COM5", "USB Serial Converter", "FT99"));
        let negotiator = ConnectionNegotiator::new(StaticEnumerator(Ok(adapters)), factory, &config());

        let outcome = negotiator.negotiate();
        assert_eq!(outcome.result, ConnectionResult::Ambiguous);
        assert!(outcome.transport.is_none());
    }

    #[test]
    fn test_single_adapter_is_radio_without_probe() {
        let (factory, _cable, radio) = mock_factory();
        let adapters = vec![adapter("COM3", "Neurolink", "NL0001")];
        let negotiator = ConnectionNegotiator::new(StaticEnumerator(Ok(adapters)), factory, &config());

        let outcome = negotiator.negotiate();
        assert_eq!(outcome.result, ConnectionResult::ConnectedViaRadio);
        assert_eq!(outcome.descriptor.dongle_serial.as_deref(), Some("NL0001"));
        assert!(radio.written().is_empty());
    }

    #[test]
    fn test_no_adapters_and_scan_errors() {
        let (factory, _, _) = mock_factory();
        let negotiator = ConnectionNegotiator::new(StaticEnumerator(Ok(vec![])), factory, &config());
        assert_eq!(negotiator.negotiate().result, ConnectionResult::NoneFound);

        let (factory, _, _) = mock_factory();
        let negotiator =
            ConnectionNegotiator::new(StaticEnumerator(Err("no permission".into())), factory, &config());
        let outcome = negotiator.negotiate();
        assert_eq!(outcome.result, ConnectionResult::ScanError);
        assert!(outcome.last_error.unwrap().contains("no permission"));
    }

    #[test]
    fn test_dual_without_suffixes_is_scan_error() {
        let (factory, _, _) = mock_factory();
        let adapters = vec![
            adapter("COM3", "Neurolink", "NL01"),
            adapter("COM4", "Neurolink", "NL02"),
        ];
        let negotiator = ConnectionNegotiator::new(StaticEnumerator(Ok(adapters)), factory, &config());
        assert_eq!(negotiator.negotiate().result, ConnectionResult::ScanError);
    }

    #[test]
    fn test_connect_confirms_radio_signature() {
        let (factory, _cable, radio) = mock_factory();
        answer_connect(&radio);
        let adapters = vec![adapter("COM3", "Neurolink", "NL0001")];
        let negotiator = ConnectionNegotiator::new(StaticEnumerator(Ok(adapters)), factory, &config());

        let mut outcome = negotiator.negotiate();
        assert!(negotiator.connect(&mut outcome));
        assert_eq!(outcome.result, ConnectionResult::ConnectedViaRadio);
        assert!(radio.is_open());
    }

    #[test]
    fn test_connect_failures_map_to_probe_errors() {
        let (factory, _cable, radio) = mock_factory();
        let adapters = vec![adapter("COM3", "Neurolink", "NL0001")];
        let negotiator = ConnectionNegotiator::new(StaticEnumerator(Ok(adapters.clone())), factory, &config());
        let mut outcome = negotiator.negotiate();
        assert!(!negotiator.connect(&mut outcome));
        assert_eq!(outcome.result, ConnectionResult::RadioProbeError);
        assert!(outcome.transport.is_none());
        assert!(!radio.is_open());

        let (factory, _cable, radio) = mock_factory();
        radio.set_fail_reads(true);
        let negotiator = ConnectionNegotiator::new(StaticEnumerator(Ok(adapters)), factory, &config());
        let mut outcome = negotiator.negotiate();
        assert!(!negotiator.connect(&mut outcome));
        assert_eq!(outcome.result, ConnectionResult::DiagnosticReadError);
        assert!(outcome.last_error.is_some());
    }

    #[test]
    fn test_connect_failure_on_cable() {
        let (factory, cable, _radio) = mock_factory();
        answer_connect(&cable);
        let negotiator = ConnectionNegotiator::new(StaticEnumerator(Ok(dual_adapters())), factory, &config());
        let mut outcome = negotiator.negotiate();
        assert_eq!(outcome.result, ConnectionResult::ConnectedViaCable);

        // Device goes quiet after selection
        cable.set_fail_writes(true);
        assert!(!negotiator.connect(&mut outcome));
        assert_eq!(outcome.result, ConnectionResult::CableProbeError);
    }

    #[test]
    fn test_factory_carries_link_settings_into_serial_config() {
        let mut config = EngineConfig::default();
        config.parity = Parity::Even;
        config.cable_baud_rate = 57_600;
        let factory = SerialTransportFactory::from_config(&config);
        let cable = adapter("COM4", "Neurolink B", "NL0042B");

        let first = factory.serial_config(&cable, factory.cable_baud_rate);
        let second = factory.serial_config(&cable, factory.cable_baud_rate);
        assert_eq!(first.parity, Parity::Even);
        assert_eq!(second.parity, Parity::Even);
        assert_eq!(first.baud_rate, 57_600);
        assert_eq!(first.port, "COM4");
        assert_eq!(factory.parity, Parity::Even);
    }
}

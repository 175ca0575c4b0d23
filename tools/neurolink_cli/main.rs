// tools/neurolink_cli/main.rs
//
// Diagnostic CLI for the Neuromaster engine.
//
//   neurolink_cli ports                 list serial adapters and which ones match
//   neurolink_cli serve --seconds 30    negotiate, connect, stream samples over TCP
//   neurolink_cli crc 0f0101            CRC8 of a hex string

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use neurolink_lib::checksums::Crc8Polynomial;
use neurolink_lib::device_scan::AdapterEnumerator;
use neurolink_lib::logging::init_file_logging;
use neurolink_lib::neuromaster::CommandRequest;
use neurolink_lib::{
    tlog, ConnectionNegotiator, Crc8, Engine, EngineConfig, EngineEvent, TcpFanoutServer,
};

#[derive(Parser, Debug)]
#[command(name = "neurolink_cli")]
#[command(version, about = "Neuromaster device diagnostics", long_about = None)]
struct Cli {
    /// Engine settings (TOML). Missing file means defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Mirror log lines into a timestamped file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial adapters
    Ports,

    /// Connect to the device and fan samples out over TCP
    Serve {
        /// Stop after this many seconds (runs until killed otherwise)
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Override the TCP port from the settings
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Compute the CRC8 of a hex byte string
    Crc {
        hex: String,

        /// Polynomial byte; the device table is used when omitted
        #[arg(long, value_parser = parse_u8)]
        polynomial: Option<u8>,
    },
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).map_err(|e| e.to_string()),
        None => s.parse::<u8>().map_err(|e| e.to_string()),
    }
}

fn main() {
    let cli = Cli::parse();

    if let Some(dir) = cli.log_dir.as_deref() {
        if let Err(e) = init_file_logging(dir) {
            eprintln!("Failed to start file logging: {}", e);
        }
    }

    let config = match cli.config.as_deref() {
        Some(path) => match EngineConfig::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(2);
            }
        },
        None => EngineConfig::default(),
    };

    let result = match cli.command {
        Commands::Ports => list_ports(&config),
        Commands::Serve { seconds, port } => serve(config, seconds.map(Duration::from_secs), port),
        Commands::Crc { hex, polynomial } => crc(&hex, polynomial),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn list_ports(config: &EngineConfig) -> Result<(), String> {
    let adapters = neurolink_lib::device_scan::SystemAdapterEnumerator
        .list()
        .map_err(|e| e.to_string())?;
    if adapters.is_empty() {
        println!("No serial adapters found");
        return Ok(());
    }
    for adapter in adapters {
        let matched = config
            .device_name_filters
            .iter()
            .any(|f| adapter.description.contains(f.as_str()));
        println!(
            "{} {:<20} {:<28} serial={} vid={} pid={}",
            if matched { "*" } else { " " },
            adapter.port_name,
            adapter.description,
            adapter.serial_number.as_deref().unwrap_or("-"),
            adapter.vid.map(|v| format!("{:04x}", v)).unwrap_or_else(|| "-".into()),
            adapter.pid.map(|p| format!("{:04x}", p)).unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

fn serve(mut config: EngineConfig, duration: Option<Duration>, port: Option<u16>) -> Result<(), String> {
    if let Some(port) = port {
        config.tcp_port = port;
    }

    let negotiator = ConnectionNegotiator::system(&config);
    let mut outcome = negotiator.negotiate();
    if !outcome.result.is_connected() || !negotiator.connect(&mut outcome) {
        return Err(format!(
            "no device: {:?}{}",
            outcome.result,
            outcome
                .last_error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        ));
    }
    let transport = outcome
        .transport
        .take()
        .ok_or_else(|| "negotiation returned no transport".to_string())?;
    tlog!(
        "[cli] Connected via {} on {}",
        outcome.descriptor.kind,
        outcome.descriptor.port_name.as_deref().unwrap_or("?")
    );

    let (server_tx, server_rx) = mpsc::channel();
    let server = Arc::new(
        TcpFanoutServer::start(
            &config.tcp_bind_address,
            config.tcp_port,
            config.accept_poll_interval(),
            config.client_queue_depth,
            server_tx,
        )
        .map_err(|e| e.to_string())?,
    );
    std::thread::spawn(move || {
        for event in server_rx {
            tlog!("[cli] {:?}", event);
        }
    });

    let (mut engine, events) = Engine::start(transport, &config, Some(server)).map_err(|e| e.to_string())?;
    let commands = engine.commands();
    for request in [CommandRequest::get_firmware_version(), CommandRequest::get_clock()] {
        commands.send(request).map_err(|e| e.to_string())?;
    }
    commands.read_device_config().map_err(|e| e.to_string())?;

    let deadline = duration.map(|d| Instant::now() + d);
    let mut samples: u64 = 0;
    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(EngineEvent::DataReady(batch)) => samples += batch.len() as u64,
            Ok(EngineEvent::CommandCompleted { status, .. }) => println!("{}", status),
            Ok(EngineEvent::ConnectionStatus { connected: false, reason }) => {
                println!("Disconnected: {}", reason);
                break;
            }
            Ok(event) => println!("{:?}", event),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let _ = commands.send(CommandRequest::set_connection_closed());
    std::thread::sleep(config.idle_sleep() * 5);
    engine.stop();
    println!("{} samples forwarded", samples);
    Ok(())
}

fn crc(hex_input: &str, polynomial: Option<u8>) -> Result<(), String> {
    let bytes = hex::decode(hex_input.trim()).map_err(|e| format!("invalid hex: {}", e))?;
    let crc = match polynomial {
        Some(p) => Crc8::new(Crc8Polynomial::Custom(p)),
        None => Crc8::default(),
    };
    println!("{:02x}", crc.checksum(&bytes));
    Ok(())
}

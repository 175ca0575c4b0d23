// src/io/tcp/server.rs
//
// TCP fan-out server. Every connected client receives each decoded sample.
// One acceptor thread polls the listener; each client gets a handler thread
// (reads inbound packets) and a writer thread draining a bounded queue, so a
// slow or dead client never stalls the others or the caller of `write`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use uuid::Uuid;

use super::packet::{encode_sample, PacketHeader, PacketType, HEADER_SIZE};
use crate::io::IoError;
use crate::neuromaster::DataSample;
use crate::tlog;

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Status {
        client_id: String,
        remote: SocketAddr,
        connected: bool,
    },
    MessageReady {
        client_id: String,
        payload: Vec<u8>,
    },
    ClientError {
        client_id: String,
        message: String,
    },
}

// ============================================================================
// Server
// ============================================================================

struct ClientSlot {
    remote: SocketAddr,
    /// Kept so `stop` can force the handler's blocking read to return
    stream: TcpStream,
    outbound: SyncSender<Arc<Vec<u8>>>,
}

type ClientMap = Arc<Mutex<HashMap<String, ClientSlot>>>;

pub struct TcpFanoutServer {
    local_addr: SocketAddr,
    clients: ClientMap,
    stop_flag: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    acceptor: Option<JoinHandle<()>>,
}

impl TcpFanoutServer {
    /// Bind and start accepting. Port 0 picks an ephemeral port.
    pub fn start(
        bind_address: &str,
        port: u16,
        accept_interval: Duration,
        queue_depth: usize,
        events: Sender<ServerEvent>,
    ) -> Result<Self, IoError> {
        let device = format!("tcp({}:{})", bind_address, port);
        let listener = TcpListener::bind((bind_address, port))
            .map_err(|e| IoError::connection(&device, format!("bind: {}", e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| IoError::connection(&device, format!("set_nonblocking: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| IoError::connection(&device, e.to_string()))?;

        let clients: ClientMap = Arc::new(Mutex::new(HashMap::new()));
        let stop_flag = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let clients = clients.clone();
            let stop_flag = stop_flag.clone();
            std::thread::Builder::new()
                .name("tcp-acceptor".to_string())
                .spawn(move || {
                    run_acceptor(listener, accept_interval, queue_depth.max(1), clients, stop_flag, events)
                })
                .map_err(|e| IoError::configuration(format!("spawn acceptor: {}", e)))?
        };

        tlog!("[tcp] Fan-out server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            clients,
            stop_flag,
            dropped: Arc::new(AtomicU64::new(0)),
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Packets dropped because a client's queue was full
    pub fn dropped_packets(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue one sample for every client. Returns how many clients took it.
    pub fn write(&self, sample: &DataSample) -> Result<usize, IoError> {
        let packet = Arc::new(encode_sample(sample)?);
        let clients = self
            .clients
            .lock()
            .map_err(|_| IoError::write("tcp", "client table poisoned"))?;

        let mut delivered = 0;
        for slot in clients.values() {
            match slot.outbound.try_send(packet.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        Ok(delivered)
    }

    /// Close the listener and every client socket. Client handlers are not
    /// joined; they exit on their own once their socket errors.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
        if let Ok(mut clients) = self.clients.lock() {
            for (id, slot) in clients.drain() {
                let _ = slot.stream.shutdown(Shutdown::Both);
                tlog!("[tcp] Closing client {} ({})", id, slot.remote);
            }
        }
    }
}

impl Drop for TcpFanoutServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Acceptor
// ============================================================================

fn run_acceptor(
    listener: TcpListener,
    accept_interval: Duration,
    queue_depth: usize,
    clients: ClientMap,
    stop_flag: Arc<AtomicBool>,
    events: Sender<ServerEvent>,
) {
    while !stop_flag.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, remote)) => {
                if let Err(e) = register_client(stream, remote, queue_depth, &clients, &events) {
                    tlog!("[tcp] Rejecting client {}: {}", remote, e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(accept_interval);
            }
            Err(e) => {
                tlog!("[tcp] Accept failed: {}", e);
                std::thread::sleep(accept_interval);
            }
        }
    }
    tlog!("[tcp] Acceptor stopped");
}

fn short_client_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn register_client(
    stream: TcpStream,
    remote: SocketAddr,
    queue_depth: usize,
    clients: &ClientMap,
    events: &Sender<ServerEvent>,
) -> std::io::Result<()> {
    // Accepted sockets inherit non-blocking mode on some platforms
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let reader = stream.try_clone()?;
    let writer = stream.try_clone()?;

    let client_id = short_client_id();
    let (outbound, queue) = mpsc::sync_channel::<Arc<Vec<u8>>>(queue_depth);

    {
        let mut table = clients
            .lock()
            .map_err(|_| std::io::Error::other("client table poisoned"))?;
        table.insert(
            client_id.clone(),
            ClientSlot {
                remote,
                stream,
                outbound,
            },
        );
    }

    tlog!("[tcp] Client {} connected from {}", client_id, remote);
    let _ = events.send(ServerEvent::Status {
        client_id: client_id.clone(),
        remote,
        connected: true,
    });

    let writer_id = client_id.clone();
    std::thread::Builder::new()
        .name(format!("tcp-writer-{}", client_id))
        .spawn(move || run_writer(writer, queue, writer_id))?;

    let clients = clients.clone();
    let events = events.clone();
    std::thread::Builder::new()
        .name(format!("tcp-client-{}", client_id))
        .spawn(move || run_handler(reader, client_id, remote, clients, events))?;

    Ok(())
}

// ============================================================================
// Per-Client Threads
// ============================================================================

fn run_writer(mut stream: TcpStream, queue: mpsc::Receiver<Arc<Vec<u8>>>, client_id: String) {
    for packet in queue {
        if let Err(e) = stream.write_all(&packet) {
            tlog!("[tcp] Client {} write failed: {}", client_id, e);
            let _ = stream.shutdown(Shutdown::Both);
            break;
        }
    }
}

fn read_header(stream: &mut TcpStream) -> std::io::Result<[u8; HEADER_SIZE]> {
    let mut buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

fn run_handler(
    mut stream: TcpStream,
    client_id: String,
    remote: SocketAddr,
    clients: ClientMap,
    events: Sender<ServerEvent>,
) {
    loop {
        let header = match read_header(&mut stream) {
            Ok(buf) => match PacketHeader::parse(&buf) {
                Ok(header) => header,
                // One retry: the next 8 bytes may be a valid header
                Err(first) => match read_header(&mut stream).map(|b| PacketHeader::parse(&b)) {
                    Ok(Ok(header)) => header,
                    Ok(Err(_)) => {
                        let _ = events.send(ServerEvent::ClientError {
                            client_id: client_id.clone(),
                            message: format!("protocol mismatch: {}", first),
                        });
                        break;
                    }
                    Err(_) => break,
                },
            },
            Err(_) => break,
        };

        let mut payload = vec![0u8; header.following_length as usize];
        if stream.read_exact(&mut payload).is_err() {
            break;
        }

        let event = match header.packet_type {
            PacketType::Data => ServerEvent::MessageReady {
                client_id: client_id.clone(),
                payload,
            },
            PacketType::Error => ServerEvent::ClientError {
                client_id: client_id.clone(),
                message: String::from_utf8_lossy(&payload).into_owned(),
            },
        };
        let _ = events.send(event);
    }

    if let Ok(mut table) = clients.lock() {
        table.remove(&client_id);
    }
    let _ = stream.shutdown(Shutdown::Both);
    tlog!("[tcp] Client {} ({}) disconnected", client_id, remote);
    let _ = events.send(ServerEvent::Status {
        client_id,
        remote,
        connected: false,
    });
}

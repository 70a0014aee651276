//! Outbound frame channels.
//!
//! - `UdpChannel`: Unicast datagrams to one destination.
//! - `TcpServerChannel`: Broadcasts to every connected client and forwards inbound
//!   command frames to the publisher.
//! - `MemoryChannel`: Collects frames in memory.

use super::PublisherError;
use crate::ieee_c37_118::codec::IeeeC37118Codec;
use crate::ieee_c37_118::common::Version;
use crate::parser::assembler::FrameAssembler;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(250);
/// A client whose socket stays full this long is dropped.
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub trait FrameChannel: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<(), PublisherError>;

    /// Endpoint description for logs and status.
    fn description(&self) -> String;
}

pub struct UdpChannel {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl UdpChannel {
    pub fn connect(destination: impl ToSocketAddrs) -> Result<Self, PublisherError> {
        let destination = destination
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| PublisherError::Channel("UDP destination did not resolve".to_string()))?;
        let bind: SocketAddr = if destination.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        Ok(UdpChannel {
            socket: UdpSocket::bind(bind)?,
            destination,
        })
    }
}

impl FrameChannel for UdpChannel {
    fn send(&self, frame: &[u8]) -> Result<(), PublisherError> {
        self.socket.send_to(frame, self.destination)?;
        Ok(())
    }

    fn description(&self) -> String {
        format!("udp://{}", self.destination)
    }
}

struct Client {
    id: u64,
    stream: Arc<TcpStream>,
}

type Clients = Arc<Mutex<Vec<Client>>>;

/// A listening socket that fans frames out to all clients.
///
/// Bytes read from clients are cut into C37.118 frames (command frames use that
/// layout for every protocol) and sent to the receiver returned by `bind`. Writes
/// happen outside the client list lock, so a stalled client delays a send by at most
/// the write timeout and never blocks `shutdown`.
pub struct TcpServerChannel {
    local_addr: SocketAddr,
    clients: Clients,
    running: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServerChannel {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<(Self, Receiver<Vec<u8>>), PublisherError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let clients = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();

        let acceptor = {
            let clients = Arc::clone(&clients);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name(format!("publisher-accept-{}", local_addr.port()))
                .spawn(move || accept_loop(listener, clients, running, tx))?
        };

        info!("Publisher listening on tcp://{}", local_addr);
        Ok((
            TcpServerChannel {
                local_addr,
                clients,
                running,
                acceptor: Mutex::new(Some(acceptor)),
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Stops accepting and drops every client. Safe to call more than once.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }
        let clients: Vec<Client> = self.clients.lock().drain(..).collect();
        for client in clients {
            let _ = client.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Drop for TcpServerChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl FrameChannel for TcpServerChannel {
    fn send(&self, frame: &[u8]) -> Result<(), PublisherError> {
        let targets: Vec<(u64, Arc<TcpStream>)> = self
            .clients
            .lock()
            .iter()
            .map(|client| (client.id, Arc::clone(&client.stream)))
            .collect();

        let mut failed = Vec::new();
        for (id, stream) in targets {
            if let Err(e) = (&*stream).write_all(frame) {
                debug!("Dropping publisher client {:?}: {}", stream.peer_addr(), e);
                let _ = stream.shutdown(std::net::Shutdown::Both);
                failed.push(id);
            }
        }
        if !failed.is_empty() {
            self.clients.lock().retain(|client| !failed.contains(&client.id));
        }
        Ok(())
    }

    fn description(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }
}

fn accept_loop(
    listener: TcpListener,
    clients: Clients,
    running: Arc<AtomicBool>,
    commands: Sender<Vec<u8>>,
) {
    let next_id = AtomicU64::new(0);
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("Publisher client connected: {}", peer);
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = register_client(id, stream, &clients, &running, &commands) {
                    warn!("Failed to register publisher client {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!("Publisher accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn register_client(
    id: u64,
    stream: TcpStream,
    clients: &Clients,
    running: &Arc<AtomicBool>,
    commands: &Sender<Vec<u8>>,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT))?;
    let reader = stream.try_clone()?;
    reader.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;
    clients.lock().push(Client {
        id,
        stream: Arc::new(stream),
    });

    let running = Arc::clone(running);
    let commands = commands.clone();
    thread::Builder::new()
        .name("publisher-client".to_string())
        .spawn(move || read_commands(reader, running, commands))?;
    Ok(())
}

fn read_commands(mut reader: TcpStream, running: Arc<AtomicBool>, commands: Sender<Vec<u8>>) {
    let codec = IeeeC37118Codec::new(Version::V2011);
    let mut assembler = FrameAssembler::new(1024);
    let mut buf = [0u8; 1024];

    while running.load(Ordering::SeqCst) {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                assembler.extend(&buf[..n]);
                while let Some(frame) = assembler.next_frame(&codec) {
                    match frame {
                        Ok(frame) => {
                            if commands.send(frame.to_vec()).is_err() {
                                return;
                            }
                        }
                        Err(e) => debug!("Discarding inbound bytes: {}", e),
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                debug!("Publisher client read failed: {}", e);
                break;
            }
        }
    }
}

/// Keeps every frame sent through it.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        MemoryChannel::default()
    }

    /// Removes and returns the frames sent so far.
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock())
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

impl FrameChannel for MemoryChannel {
    fn send(&self, frame: &[u8]) -> Result<(), PublisherError> {
        self.frames.lock().push(frame.to_vec());
        Ok(())
    }

    fn description(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_for_clients(server: &TcpServerChannel, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.client_count() != count {
            assert!(Instant::now() < deadline, "expected {} clients", count);
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_broadcast_reaches_every_client() {
        let (server, _commands) = TcpServerChannel::bind("127.0.0.1:0").unwrap();
        let mut a = TcpStream::connect(server.local_addr()).unwrap();
        let mut b = TcpStream::connect(server.local_addr()).unwrap();
        wait_for_clients(&server, 2);

        server.send(&[0xAA, 0x01, 0x02]).unwrap();
        for client in [&mut a, &mut b] {
            let mut buf = [0u8; 3];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(buf, [0xAA, 0x01, 0x02]);
        }
    }

    #[test]
    fn test_stalled_client_is_dropped_without_blocking_sends() {
        let (server, _commands) = TcpServerChannel::bind("127.0.0.1:0").unwrap();
        let server = Arc::new(server);
        // Connected but never reads.
        let _stalled = TcpStream::connect(server.local_addr()).unwrap();
        wait_for_clients(&server, 1);

        let (done_tx, done_rx) = mpsc::channel();
        {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                let frame = vec![0u8; 65_000];
                for _ in 0..2_000 {
                    server.send(&frame).unwrap();
                }
                let _ = done_tx.send(());
            });
        }

        assert!(done_rx.recv_timeout(Duration::from_secs(10)).is_ok());
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_shutdown_is_not_held_up_by_a_stalled_send() {
        let (server, _commands) = TcpServerChannel::bind("127.0.0.1:0").unwrap();
        let server = Arc::new(server);
        let _stalled = TcpStream::connect(server.local_addr()).unwrap();
        wait_for_clients(&server, 1);

        {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                let frame = vec![0u8; 65_000];
                while server.client_count() > 0 {
                    let _ = server.send(&frame);
                }
            });
        }
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        server.shutdown();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(server.client_count(), 0);
    }
}

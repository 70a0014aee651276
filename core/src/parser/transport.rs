//! Byte sources for the parser. Every transport reads with a timeout so the worker
//! notices stop requests; timeouts surface as `WouldBlock` or `TimedOut`.

use super::settings::{SerialParity, TransportSettings};
use super::ParserError;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

pub const READ_TIMEOUT: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub trait Transport: Send {
    /// Reads available bytes. `Ok(0)` means the source has ended.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Restarts a replayable source. Returns `false` when the source cannot rewind.
    fn rewind(&mut self) -> io::Result<bool> {
        Ok(false)
    }

    fn description(&self) -> String;
}

pub fn is_timeout(error: &io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Opens the transport described by `settings`.
pub fn open(settings: &TransportSettings) -> Result<Box<dyn Transport>, ParserError> {
    Ok(match settings {
        TransportSettings::Tcp { server } => Box::new(TcpTransport::connect(server)?),
        TransportSettings::Udp {
            interface,
            local_port,
            server,
        } => Box::new(UdpTransport::bind(interface, *local_port, server.as_deref())?),
        TransportSettings::Serial {
            port,
            baud_rate,
            parity,
            stop_bits,
            data_bits,
        } => Box::new(SerialTransport::open(port, *baud_rate, *parity, *stop_bits, *data_bits)?),
        TransportSettings::File { path } => Box::new(FileTransport {
            file: File::open(path)?,
            path: path.display().to_string(),
        }),
    })
}

fn resolve(address: &str) -> Result<SocketAddr, ParserError> {
    address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ParserError::InvalidSetting {
            key: "server".to_string(),
            value: address.to_string(),
        })
}

pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpTransport {
    pub fn connect(server: &str) -> Result<Self, ParserError> {
        let peer = resolve(server)?;
        let stream = TcpStream::connect_timeout(&peer, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_write_timeout(Some(CONNECT_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport { stream, peer })
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    fn description(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
    remote: Option<SocketAddr>,
    fixed_remote: bool,
}

impl UdpTransport {
    pub fn bind(interface: &str, local_port: u16, server: Option<&str>) -> Result<Self, ParserError> {
        let socket = UdpSocket::bind((interface, local_port))?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let remote = server.map(resolve).transpose()?;
        Ok(UdpTransport {
            socket,
            fixed_remote: remote.is_some(),
            remote,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, peer) = self.socket.recv_from(buf)?;
        if !self.fixed_remote {
            self.remote = Some(peer);
        }
        if n == 0 {
            // An empty datagram is not the end of the stream.
            return Err(io::Error::from(ErrorKind::WouldBlock));
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let remote = self.remote.ok_or_else(|| {
            io::Error::new(ErrorKind::NotConnected, "no UDP peer known for commands")
        })?;
        self.socket.send_to(bytes, remote).map(|_| ())
    }

    fn description(&self) -> String {
        match self.socket.local_addr() {
            Ok(addr) => format!("udp://{}", addr),
            Err(_) => "udp://unbound".to_string(),
        }
    }
}

pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialTransport {
    pub fn open(
        name: &str,
        baud_rate: u32,
        parity: SerialParity,
        stop_bits: u8,
        data_bits: u8,
    ) -> Result<Self, ParserError> {
        let parity = match parity {
            SerialParity::None => serialport::Parity::None,
            SerialParity::Odd => serialport::Parity::Odd,
            SerialParity::Even => serialport::Parity::Even,
        };
        let stop_bits = match stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        };
        let data_bits = match data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        let port = serialport::new(name, baud_rate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits)
            .timeout(READ_TIMEOUT)
            .open()?;
        Ok(SerialTransport {
            port,
            name: name.to_string(),
        })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            // Serial lines never end; a zero read is an idle line.
            Ok(0) => Err(io::Error::from(ErrorKind::TimedOut)),
            other => other,
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)
    }

    fn description(&self) -> String {
        format!("serial://{}", self.name)
    }
}

pub struct FileTransport {
    file: File,
    path: String,
}

impl Transport for FileTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write_all(&mut self, _bytes: &[u8]) -> io::Result<()> {
        // Commands have nowhere to go during playback.
        Ok(())
    }

    fn rewind(&mut self) -> io::Result<bool> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(true)
    }

    fn description(&self) -> String {
        format!("file://{}", self.path)
    }
}

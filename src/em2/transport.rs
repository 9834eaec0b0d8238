use crate::error::Em2Error;
use log::{debug, warn};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Connection configuration for the electrometer TCP link.
///
/// The read and write timeouts bound every single attempt; a timed-out attempt
/// makes the client drop the socket and open a new one.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Timeout for one read from the socket
    pub read_timeout: Duration,
    /// Timeout for one write to the socket
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
        }
    }
}

/// A live byte stream to the instrument.
pub trait Transport: Send {
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read whatever is available. `Ok(0)` means the peer closed the stream.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens fresh transports to one fixed endpoint.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Transport>, Em2Error>;

    /// Human readable endpoint, used in log messages.
    fn endpoint(&self) -> String;
}

/// Errors after which the socket is considered lost and must be replaced.
pub fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

impl Transport for TcpStream {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data)?;
        self.flush()
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

/// Connects to the electrometer over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    config: ConnectionConfig,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16, config: ConnectionConfig) -> Result<Self, Em2Error> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| Em2Error::InvalidAddress(format!("{host}:{port}")))?
            .next()
            .ok_or_else(|| Em2Error::InvalidAddress(format!("{host}:{port}")))?;
        Ok(Self { addr, config })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> Result<Box<dyn Transport>, Em2Error> {
        debug!("Connecting to electrometer at {}", self.addr);

        let stream = TcpStream::connect_timeout(&self.addr, self.config.connect_timeout)
            .map_err(|e| {
                warn!("Failed to connect to {}: {e}", self.addr);
                Em2Error::Io {
                    source: e,
                    context: format!("Failed to connect to {}", self.addr),
                }
            })?;

        stream
            .set_read_timeout(Some(self.config.read_timeout))
            .map_err(|e| Em2Error::Io {
                source: e,
                context: "Setting read timeout".to_string(),
            })?;
        stream
            .set_write_timeout(Some(self.config.write_timeout))
            .map_err(|e| Em2Error::Io {
                source: e,
                context: "Setting write timeout".to_string(),
            })?;
        stream.set_nodelay(true).map_err(|e| Em2Error::Io {
            source: e,
            context: "Disabling Nagle".to_string(),
        })?;

        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        self.addr.to_string()
    }
}

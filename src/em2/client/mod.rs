use super::protocol::{Protocol, RECV_ATTEMPTS, RECV_CHUNK_SIZE, SEND_ATTEMPTS};
use super::transport::{is_transient, ConnectionConfig, Connector, TcpConnector, Transport};
use crate::error::Em2Error;
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::time::Duration;

pub mod acquisition;
pub mod channel;
pub mod trigger;

/// Builder for constructing [`Em2Client`] instances.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use rusty_em::Em2Client;
///
/// let client = Em2Client::builder()
///     .address("electproto19")
///     .port(5025)
///     .read_timeout(Duration::from_millis(500))
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct Em2ClientBuilder {
    address: Option<String>,
    port: Option<u16>,
    config: ConnectionConfig,
}

impl Em2ClientBuilder {
    pub fn address(mut self, addr: &str) -> Self {
        self.address = Some(addr.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the full connection configuration
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Set write timeout
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Build the Em2Client and open the first connection
    pub fn build(self) -> Result<Em2Client, Em2Error> {
        let address = self
            .address
            .ok_or_else(|| Em2Error::Usage("Address must be specified".to_string()))?;

        let port = self
            .port
            .ok_or_else(|| Em2Error::Usage("Port must be specified".to_string()))?;

        let connector = TcpConnector::new(&address, port, self.config)?;
        Em2Client::with_connector(Box::new(connector))
    }
}

/// Command channel to an ALBA EM2 electrometer.
///
/// The client owns the single TCP connection to the instrument and serialises
/// every request/response exchange behind one lock: the protocol carries no
/// request identifiers, so two commands must never interleave on the wire.
/// All methods take `&self`; share the client between threads with an `Arc`.
///
/// # Failure handling
///
/// - A write that times out replaces the socket with a fresh connection and is
///   retried, at most two attempts in total.
/// - A read that times out replaces the socket and re-issues the original
///   command, at most five attempts in total.
/// - Exhausting either bound yields [`Em2Error::CommunicationLost`].
///
/// # Examples
///
/// ```no_run
/// use rusty_em::Em2Client;
///
/// let client = Em2Client::new("electproto19", 5025)?;
/// let status = client.acquisition_status()?;
/// println!("{:?} ({})", status.state, status.status);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Em2Client {
    connector: Box<dyn Connector>,
    link: Mutex<Box<dyn Transport>>,
}

impl Em2Client {
    /// Connect with the default configuration (1 s timeouts).
    pub fn new(addr: &str, port: u16) -> Result<Self, Em2Error> {
        Self::builder().address(addr).port(port).build()
    }

    pub fn builder() -> Em2ClientBuilder {
        Em2ClientBuilder::default()
    }

    /// Create a client on top of any connector and open the first connection.
    pub fn with_connector(connector: Box<dyn Connector>) -> Result<Self, Em2Error> {
        let transport = connector.connect()?;
        debug!("Connected to electrometer at {}", connector.endpoint());
        Ok(Self {
            connector,
            link: Mutex::new(transport),
        })
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    /// Execute one command.
    ///
    /// Returns `Ok(None)` when no response was requested, or when the
    /// instrument closed the connection without answering. An answer starting
    /// with `ERROR` is returned as `Em2Error::Instrument`.
    pub fn execute(
        &self,
        command: &str,
        expect_response: bool,
    ) -> Result<Option<String>, Em2Error> {
        let answer = self.exchange(command, expect_response)?;
        if let Some(answer) = &answer {
            Protocol::check_error(command, answer)?;
        }
        Ok(answer)
    }

    /// One request/response exchange; the answer is returned as text, even
    /// when it reports an error.
    fn exchange(
        &self,
        command: &str,
        expect_response: bool,
    ) -> Result<Option<String>, Em2Error> {
        let frame = Protocol::frame_command(command);
        let mut link = self.link.lock();

        debug!("-> {command}");
        self.send_with_retry(&mut link, command, &frame)?;

        if !expect_response {
            return Ok(None);
        }

        let Some(raw) = self.receive_with_retry(&mut link, command, &frame)? else {
            return Ok(None);
        };

        let answer = Protocol::extract_answer(&raw);
        debug!("<- {answer}");
        Ok(Some(answer))
    }

    /// Execute a command and return its answer.
    pub fn query(&self, command: &str) -> Result<String, Em2Error> {
        self.execute(command, true)?
            .ok_or_else(|| Em2Error::NoResponse(command.to_string()))
    }

    /// Execute a setting command; the instrument's acknowledgement is discarded.
    pub fn command(&self, command: &str) -> Result<(), Em2Error> {
        self.query(command).map(|_| ())
    }

    fn reconnect(&self, link: &mut Box<dyn Transport>) -> Result<(), Em2Error> {
        *link = self.connector.connect()?;
        debug!("Reconnected to {}", self.connector.endpoint());
        Ok(())
    }

    fn send_with_retry(
        &self,
        link: &mut Box<dyn Transport>,
        command: &str,
        frame: &[u8],
    ) -> Result<(), Em2Error> {
        for attempt in 1..=SEND_ATTEMPTS {
            match link.send(frame) {
                Ok(()) => return Ok(()),
                Err(e) if is_transient(&e) => {
                    warn!(
                        "Socket error sending '{command}' (attempt {attempt}/{SEND_ATTEMPTS}): {e}, reconnecting"
                    );
                    self.reconnect(link)?;
                }
                Err(e) => {
                    return Err(Em2Error::Io {
                        source: e,
                        context: format!("Sending '{command}'"),
                    });
                }
            }
        }

        error!("Giving up on '{command}' after {SEND_ATTEMPTS} send attempts");
        Err(Em2Error::CommunicationLost(format!(
            "sending '{command}' failed {SEND_ATTEMPTS} times"
        )))
    }

    /// Accumulate bytes until the response ends with a newline.
    fn receive_with_retry(
        &self,
        link: &mut Box<dyn Transport>,
        command: &str,
        frame: &[u8],
    ) -> Result<Option<String>, Em2Error> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; RECV_CHUNK_SIZE];
        let mut failures = 0;

        loop {
            let failure = match link.recv(&mut chunk) {
                Ok(0) if buffer.is_empty() => {
                    warn!("Connection closed without an answer to '{command}'");
                    if let Err(e) = self.reconnect(link) {
                        warn!("Reconnect after close failed: {e}");
                    }
                    return Ok(None);
                }
                Ok(0) => "connection closed mid-answer".to_string(),
                Ok(n) => {
                    failures = 0;
                    buffer.extend_from_slice(&chunk[..n]);
                    if Protocol::is_complete(&buffer) {
                        return Ok(Some(String::from_utf8_lossy(&buffer).into_owned()));
                    }
                    continue;
                }
                Err(e) if is_transient(&e) => e.to_string(),
                Err(e) => {
                    return Err(Em2Error::Io {
                        source: e,
                        context: format!("Reading answer to '{command}'"),
                    });
                }
            };

            failures += 1;
            warn!(
                "Socket error reading answer to '{command}' (attempt {failures}/{RECV_ATTEMPTS}): {failure}, reconnecting"
            );
            self.reconnect(link)?;

            if failures >= RECV_ATTEMPTS {
                error!("Unable to communicate with the electrometer, restart required");
                return Err(Em2Error::CommunicationLost(format!(
                    "no answer to '{command}' after {RECV_ATTEMPTS} attempts"
                )));
            }

            // the new connection has no pending request, ask again
            buffer.clear();
            if let Err(e) = link.send(frame) {
                if !is_transient(&e) {
                    return Err(Em2Error::Io {
                        source: e,
                        context: format!("Re-sending '{command}'"),
                    });
                }
                warn!("Re-sending '{command}' failed: {e}");
            }
        }
    }
}

use super::protocol::{self, Command, KILL_MOVES_BASE, PROGRAM_PROMPT, RESPONSE_SETTLE, axis_bit};
use crate::axis::AxisId;
use crate::error::ScannerError;
use log::{debug, info, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Half-duplex request/response transport to the motion controller.
///
/// Exactly one command is in flight at a time: `send` writes, waits for the
/// controller to echo, and drains the reply before returning.
pub trait CommandChannel {
    /// Send one command line and return the numeric answer, if any.
    ///
    /// `Ok(None)` is the normal result for fire-and-forget commands.
    /// Transport failures that survive one reconnect attempt are errors.
    fn send(&mut self, command: &str) -> Result<Option<f64>, ScannerError>;

    fn send_command(&mut self, command: &Command) -> Result<Option<f64>, ScannerError> {
        self.send(&command.to_string())
    }
}

/// Connection configuration for the controller socket.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use emittance_scanner::ConnectionConfig;
///
/// let config = ConnectionConfig {
///     connect_timeout: Duration::from_secs(3),
///     ..ConnectionConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing (or re-establishing) the TCP connection
    pub connect_timeout: Duration,
    /// Timeout for writing a command
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
        }
    }
}

/// Builder for [`AcrClient`].
///
/// ```no_run
/// use emittance_scanner::AcrClient;
///
/// let client = AcrClient::builder()
///     .address("10.10.100.60")
///     .port(5002)
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct AcrClientBuilder {
    address: Option<String>,
    port: Option<u16>,
    config: ConnectionConfig,
    motion_profile: Option<Command>,
}

impl AcrClientBuilder {
    pub fn address(mut self, addr: &str) -> Self {
        self.address = Some(addr.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Ramp and velocity command issued right after the program prompt
    pub fn motion_profile(mut self, profile: Command) -> Self {
        self.motion_profile = Some(profile);
        self
    }

    /// Connect and open the program 0 prompt
    pub fn build(self) -> Result<AcrClient, ScannerError> {
        let address = self
            .address
            .ok_or_else(|| ScannerError::InvalidAddress("address must be specified".to_string()))?;
        let port = self
            .port
            .ok_or_else(|| ScannerError::InvalidAddress("port must be specified".to_string()))?;

        let socket_addr: SocketAddr = format!("{address}:{port}")
            .parse()
            .map_err(|_| ScannerError::InvalidAddress(address.clone()))?;

        let mut client = AcrClient {
            socket_addr,
            stream: None,
            config: self.config,
            motion_profile: self.motion_profile,
        };
        client.connect()?;

        Ok(client)
    }
}

/// TCP client for the ACR controller's ASCII command port.
///
/// The connection is persistent; if it drops, the next command attempts a
/// single reconnect bounded by the connect timeout before failing. Every
/// connection starts at the program 0 prompt with the motion profile set.
pub struct AcrClient {
    socket_addr: SocketAddr,
    stream: Option<TcpStream>,
    config: ConnectionConfig,
    motion_profile: Option<Command>,
}

impl AcrClient {
    pub fn builder() -> AcrClientBuilder {
        AcrClientBuilder::default()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn connect(&mut self) -> Result<(), ScannerError> {
        debug!("Connecting to motion controller at {}", self.socket_addr);

        let stream = TcpStream::connect_timeout(&self.socket_addr, self.config.connect_timeout)
            .map_err(|source| {
                warn!("Failed to connect to {}: {source}", self.socket_addr);
                ScannerError::Connection {
                    address: self.socket_addr.to_string(),
                    source,
                }
            })?;
        stream
            .set_write_timeout(Some(self.config.write_timeout))
            .map_err(|e| ScannerError::io(e, "setting write timeout"))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ScannerError::io(e, "disabling Nagle"))?;

        info!("Connected to motion controller at {}", self.socket_addr);
        self.stream = Some(stream);

        // With Master = 0 the controller only executes commands at PROG0.
        self.send(PROGRAM_PROMPT)?;
        if let Some(profile) = self.motion_profile.clone() {
            self.send_command(&profile)?;
        }
        Ok(())
    }

    /// Whether any axis' kill latch is set, or the state cannot be read
    fn kill_latched(&mut self) -> bool {
        AxisId::ALL.iter().any(|&axis| {
            !self.is_connected()
                || self
                    .send_command(&Command::QueryBit(axis_bit(KILL_MOVES_BASE, axis)))
                    .map_or(true, protocol::bit_is_set)
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream, ScannerError> {
        if self.stream.is_none() {
            self.connect()?;
        }
        self.stream.as_mut().ok_or(ScannerError::Connection {
            address: self.socket_addr.to_string(),
            source: std::io::Error::from(ErrorKind::NotConnected),
        })
    }

    /// Read every byte currently buffered without blocking.
    fn drain(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, bool)> {
        stream.set_nonblocking(true)?;
        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        let mut closed = false;

        let outcome = loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break Ok(());
                }
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };

        stream.set_nonblocking(false)?;
        outcome.map(|_| (received, closed))
    }
}

impl CommandChannel for AcrClient {
    fn send(&mut self, command: &str) -> Result<Option<f64>, ScannerError> {
        debug!(">> {command}");
        let frame = protocol::encode(command);

        let stream = self.stream()?;
        let written = stream.write_all(&frame).and_then(|_| stream.flush());
        if let Err(e) = written {
            self.stream = None;
            return Err(ScannerError::io(e, format!("writing `{command}`")));
        }

        std::thread::sleep(RESPONSE_SETTLE);

        let stream = self.stream()?;
        let (bytes, closed) = match Self::drain(stream) {
            Ok(read) => read,
            Err(e) => {
                self.stream = None;
                return Err(ScannerError::io(e, format!("reading reply to `{command}`")));
            }
        };
        if closed {
            warn!("Controller closed the connection after `{command}`");
            self.stream = None;
        }

        let reply = String::from_utf8_lossy(&bytes);
        debug!("<< {:?}", reply.trim());
        Ok(protocol::parse_reply(&reply))
    }
}

impl Drop for AcrClient {
    /// Halt any motion still running. Latches set by an emergency stop stay
    /// set until the operator clears them.
    fn drop(&mut self) {
        if !self.is_connected() {
            return;
        }
        if self.kill_latched() {
            warn!("Kill latches are set, leaving them for the operator to clear");
            return;
        }
        for command in [Command::KillAll, Command::ReleaseAll] {
            if !self.is_connected() {
                break;
            }
            let _ = self.send_command(&command);
        }
    }
}

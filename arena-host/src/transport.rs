//! Byte transports to the arena controller
//!
//! A transport moves raw bytes; framing and acknowledgement handling live
//! in the link. Three kinds are provided: TCP, serial and an in-process
//! simulated arena for dry runs.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use arena_protocol::messages::{
    CMD_SET_COLOR_DEPTH, CMD_STREAM_FRAME, CMD_TRIAL_PARAMS, STATUS_OK,
};
use arena_protocol::{decode_frame, split_command, Response, TrialParams, WireError};
use tracing::{debug, trace};

/// Default TCP port of the arena controller
pub const DEFAULT_TCP_PORT: u16 = 62222;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Shortest read timeout handed to the OS (zero means "block forever" there)
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// A bidirectional byte stream
pub trait Transport: Send {
    /// Write every byte
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read whatever is available, waiting at most `timeout`
    ///
    /// Returns `Ok(0)` when the peer closed the stream. A wait that ends
    /// with nothing to read fails with `TimedOut` or `WouldBlock`.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Release the underlying connection
    fn shutdown(&mut self) {}
}

/// Where an arena (or a plugin device) is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP controller
    Tcp { host: String, port: u16 },
    /// Serial controller
    Serial { path: String, baud_rate: u32 },
    /// Simulated arena, no real I/O
    DryRun,
}

impl Endpoint {
    /// Parse `dry-run`, `serial:PATH[@BAUD]` or `HOST[:PORT]`
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("endpoint is empty".to_string());
        }
        if input == "dry-run" {
            return Ok(Endpoint::DryRun);
        }
        if let Some(rest) = input.strip_prefix("serial:") {
            let (path, baud_rate) = match rest.rsplit_once('@') {
                Some((path, baud)) => {
                    let baud = baud
                        .parse()
                        .map_err(|_| format!("invalid baud rate `{}`", baud))?;
                    (path, baud)
                }
                None => (rest, DEFAULT_BAUD_RATE),
            };
            if path.is_empty() {
                return Err("serial path is empty".to_string());
            }
            return Ok(Endpoint::Serial {
                path: path.to_string(),
                baud_rate,
            });
        }
        Self::tcp(input)
    }

    /// Parse `HOST[:PORT]` or `[IPV6][:PORT]`, defaulting the port
    ///
    /// A bare IPv6 address has no port; brackets are stripped from the host.
    pub fn tcp(input: &str) -> Result<Self, String> {
        let parse_port = |port: &str| {
            port.parse::<u16>()
                .map_err(|_| format!("invalid port `{}`", port))
        };
        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated `[` in `{}`", input))?;
            match tail {
                "" => (host, DEFAULT_TCP_PORT),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (host, parse_port(port)?),
                    None => return Err(format!("unexpected `{}` after `]`", tail)),
                },
            }
        } else {
            match input.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, parse_port(port)?),
                _ => (input, DEFAULT_TCP_PORT),
            }
        };
        if host.is_empty() {
            return Err("host is empty".to_string());
        }
        Ok(Endpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// Open a fresh transport
    pub fn connect(&self, timeout: Duration) -> io::Result<Box<dyn Transport>> {
        match self {
            Endpoint::Tcp { host, port } => {
                Ok(Box::new(TcpTransport::connect(host, *port, timeout)?))
            }
            Endpoint::Serial { path, baud_rate } => open_serial(path, *baud_rate, timeout),
            Endpoint::DryRun => Ok(Box::new(DryRunTransport::new())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Serial { path, baud_rate } => write!(f, "serial:{}@{}", path, baud_rate),
            Endpoint::DryRun => f.write_str("dry-run"),
        }
    }
}

/// TCP connection to the arena controller
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect, trying every resolved address in turn
    pub fn connect(host: &str, port: u16, timeout: Duration) -> io::Result<Self> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout.max(MIN_READ_TIMEOUT)) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!("Connected to {}", addr);
                    return Ok(Self { stream });
                }
                Err(e) => {
                    trace!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        }))
    }
}

impl Transport for TcpTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.stream
            .set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;
        self.stream.read(buf)
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(feature = "serial")]
fn open_serial(path: &str, baud_rate: u32, timeout: Duration) -> io::Result<Box<dyn Transport>> {
    let port = serialport::new(path, baud_rate)
        .timeout(timeout.max(MIN_READ_TIMEOUT))
        .open()
        .map_err(io::Error::from)?;
    debug!("Opened serial port {} at {} baud", path, baud_rate);
    Ok(Box::new(SerialTransport { port }))
}

#[cfg(not(feature = "serial"))]
fn open_serial(path: &str, _baud_rate: u32, _timeout: Duration) -> io::Result<Box<dyn Transport>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("serial support not built in (port {})", path),
    ))
}

/// Serial connection to the arena controller
#[cfg(feature = "serial")]
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "serial")]
impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.port
            .set_timeout(timeout.max(MIN_READ_TIMEOUT))
            .map_err(io::Error::from)?;
        self.port.read(buf)
    }
}

/// In-process simulated arena
///
/// Parses every command the host writes and answers the way the controller
/// does: an acknowledgement per command, plus a completion notification
/// after an accepted trial-params command. Nothing is displayed and no
/// time passes.
#[derive(Debug, Default)]
pub struct DryRunTransport {
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    received: Vec<u8>,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opcodes received so far, in order
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    fn respond(&mut self, response: Response) {
        self.outbox.extend(response.encode().iter().copied());
    }

    fn process(&mut self) {
        loop {
            let (opcode, params, used) = match split_command(&self.inbox) {
                Ok((cmd, used)) => (cmd.opcode, cmd.params.to_vec(), used),
                Err(WireError::Incomplete) => return,
                Err(e) => {
                    // Unframeable input: answer once and drop it
                    let opcode = self.inbox.get(1).copied().unwrap_or(0);
                    self.respond(Response::new(0xFF, opcode, &e.to_string()));
                    self.inbox.clear();
                    return;
                }
            };
            self.inbox.drain(..used);
            self.received.push(opcode);
            trace!("dry-run arena: opcode 0x{:02X}, {} param bytes", opcode, params.len());

            match opcode {
                CMD_SET_COLOR_DEPTH => match params.first() {
                    Some(1) | Some(4) => self.respond(Response::new(STATUS_OK, opcode, "")),
                    _ => self.respond(Response::new(0x01, opcode, "invalid color depth")),
                },
                CMD_TRIAL_PARAMS => match TrialParams::from_bytes(&params) {
                    Ok(_) => {
                        self.respond(Response::new(STATUS_OK, opcode, ""));
                        self.respond(Response::new(STATUS_OK, opcode, "sequence completed"));
                    }
                    Err(e) => self.respond(Response::new(0x01, opcode, &e.to_string())),
                },
                CMD_STREAM_FRAME => match decode_frame(&params) {
                    Ok(_) => self.respond(Response::new(STATUS_OK, opcode, "")),
                    Err(e) => self.respond(Response::new(0x01, opcode, &e.to_string())),
                },
                _ => self.respond(Response::new(STATUS_OK, opcode, "")),
            }
        }
    }
}

impl Transport for DryRunTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inbox.extend_from_slice(bytes);
        self.process();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        if self.outbox.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no response pending"));
        }
        let n = buf.len().min(self.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

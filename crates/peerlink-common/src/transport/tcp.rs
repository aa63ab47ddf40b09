use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::peer::PeerAddress;
use crate::protocol::error::{PeerlinkError, Result};
use crate::transport::codec::{LineFramer, MAX_LINE_SIZE};

/// Default timeout for TCP operations (10 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 8 * 1024;

/// Async TCP transport for peer links.
///
/// Opens connections with a bounded connect timeout and hands them back as
/// [`LineStream`]s that apply the same timeout to every read and write.
///
/// # Example
///
/// ```no_run
/// use peerlink_common::transport::TcpTransport;
/// use peerlink_common::PeerAddress;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::new(Duration::from_secs(5));
/// let mut link = transport.connect(&PeerAddress::new("127.0.0.1", 9001)).await?;
///
/// link.write_line(b"{\"jsonrpc\":\"2.0\",\"method\":\"echo\",\"params\":1,\"id\":1}\n").await?;
/// let reply = link.read_line().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
    max_line: usize,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_line: MAX_LINE_SIZE,
        }
    }

    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Connects to a remote peer.
    ///
    /// # Errors
    ///
    /// - [`PeerlinkError::Timeout`] if the connect does not finish in time
    /// - [`PeerlinkError::Connection`] if the peer refuses or cannot be resolved
    pub async fn connect(&self, addr: &PeerAddress) -> Result<LineStream> {
        let connect = TcpStream::connect((addr.host(), addr.port()));
        let stream = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| PeerlinkError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| PeerlinkError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| PeerlinkError::Connection(format!("Failed to configure socket: {}", e)))?;

        Ok(LineStream::new(stream, Some(self.timeout)).with_max_line(self.max_line))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

/// A TCP stream that reads and writes newline-delimited lines.
#[derive(Debug)]
pub struct LineStream {
    stream: TcpStream,
    framer: LineFramer,
    timeout: Option<Duration>,
    peer: Option<SocketAddr>,
}

impl LineStream {
    /// Wraps an established stream. `timeout` bounds each read and write;
    /// `None` waits forever.
    pub fn new(stream: TcpStream, timeout: Option<Duration>) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            framer: LineFramer::new(),
            timeout,
            peer,
        }
    }

    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.framer = LineFramer::with_max_line(max_line);
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Writes one already-delimited line and flushes it.
    pub async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        let timeout = self.timeout;
        let stream = &mut self.stream;
        with_timeout(timeout, "writing line", async move {
            stream.write_all(line).await?;
            stream.flush().await
        })
        .await
    }

    /// Reads the next complete line, delimiter stripped.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly between
    /// lines. A close in the middle of a line is a connection error.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(line) = self.framer.next_line()? {
                return Ok(Some(line));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let stream = &mut self.stream;
            let n = with_timeout(self.timeout, "reading line", stream.read(&mut chunk)).await?;
            if n == 0 {
                if self.framer.is_empty() {
                    return Ok(None);
                }
                let partial = self.framer.buffered();
                self.framer.clear();
                return Err(PeerlinkError::Connection(format!(
                    "Peer closed the stream inside a {} byte line",
                    partial
                )));
            }
            self.framer.extend(&chunk[..n]);
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| map_io_error(e, "shutting down", self.timeout))
    }
}

async fn with_timeout<T, F>(timeout: Option<Duration>, context: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| PeerlinkError::Timeout(limit.as_millis() as u64))?
            .map_err(|e| map_io_error(e, context, timeout)),
        None => fut.await.map_err(|e| map_io_error(e, context, timeout)),
    }
}

/// Map IO errors to appropriate PeerlinkError variants
///
/// - Timeouts/would block -> `Timeout`
/// - Reset/aborted/refused/broken pipe -> `Connection`
/// - Other IO errors -> `Io`
pub(crate) fn map_io_error(err: std::io::Error, context: &str, timeout: Option<Duration>) -> PeerlinkError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            PeerlinkError::Timeout(timeout.unwrap_or(DEFAULT_TIMEOUT).as_millis() as u64)
        }
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::UnexpectedEof => {
            PeerlinkError::Connection(format!("{}: Connection lost ({})", context, err))
        }
        _ => PeerlinkError::Io(err),
    }
}

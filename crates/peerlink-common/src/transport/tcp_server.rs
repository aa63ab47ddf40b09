use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::peer::PeerAddress;
use crate::protocol::error::{PeerlinkError, Result};
use crate::protocol::{Dispatcher, JsonRpcResponse};
use crate::transport::codec::JsonLineCodec;
use crate::transport::tcp::LineStream;

/// Async TCP server answering JSON-RPC requests from peers.
///
/// Every accepted connection gets its own task; requests on one connection
/// are answered in order.
pub struct PeerServer {
    listener: TcpListener,
}

impl PeerServer {
    /// Creates a new server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:9001")
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| PeerlinkError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| PeerlinkError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// The bound address as a pool entry.
    pub fn peer_address(&self) -> Result<PeerAddress> {
        self.local_addr().map(PeerAddress::from)
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self, dispatcher: Arc<Dispatcher>) -> Result<()> {
        info!("Peer server listening on {}", self.local_addr()?);

        loop {
            let (stream, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| PeerlinkError::Connection(format!("Failed to accept connection: {}", e)))?;

            debug!("Connection established from {}", peer_addr);

            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, dispatcher).await {
                    warn!("Connection from {} ended: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Answers requests on a single connection until the peer hangs up.
///
/// Lines that are not requests or responses get an Invalid Request reply,
/// as do lines that overflow the size limit. Responses are dropped.
pub async fn serve_connection(stream: TcpStream, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let mut link = LineStream::new(stream, None);

    loop {
        let reply = match link.read_line().await {
            Ok(Some(line)) => dispatcher.handle_line(&line),
            Ok(None) => {
                debug!("Connection closed by peer");
                return Ok(());
            }
            Err(PeerlinkError::MessageTooLarge(size)) => {
                warn!("Discarding {} byte line without delimiter", size);
                Some(JsonRpcResponse::invalid_request())
            }
            Err(e) => return Err(e),
        };

        if let Some(response) = reply {
            let encoded = JsonLineCodec::encode_response(&response)?;
            link.write_line(&encoded).await?;
        }
    }
}

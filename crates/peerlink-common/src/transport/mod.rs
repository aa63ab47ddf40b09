//! Peerlink Transport Layer
//!
//! Line-delimited JSON over TCP.
//!
//! # Wire Format
//!
//! Every message is one compact JSON document followed by `\n`. A receiver
//! buffers bytes until it sees the delimiter, so messages may arrive split
//! across reads or several to a read.
//!
//! # Components
//!
//! - **[`JsonLineCodec`]** / **[`LineFramer`]**: encode messages, reassemble lines
//! - **[`TcpTransport`]** / **[`LineStream`]**: outbound connections with timeouts
//! - **[`PeerServer`]**: accept loop answering requests through a [`Dispatcher`](crate::protocol::Dispatcher)
//!
//! # Message Size Limits
//!
//! A line that grows past [`MAX_LINE_SIZE`] (16 MB) without a delimiter is
//! discarded and reported as [`MessageTooLarge`](crate::PeerlinkError::MessageTooLarge).

pub mod codec;
pub mod tcp;
pub mod tcp_server;

pub use codec::{JsonLineCodec, LineFramer, DELIMITER, MAX_LINE_SIZE};
pub use tcp::{LineStream, TcpTransport, DEFAULT_TIMEOUT};
pub use tcp_server::{serve_connection, PeerServer};

#[cfg(test)]
mod tests;

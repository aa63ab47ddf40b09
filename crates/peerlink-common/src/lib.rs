//! Peerlink Common Types and Transport
//!
//! This crate provides the protocol definitions and TCP transport layer
//! shared by the Peerlink pool manager, client and CLI.
//!
//! # Overview
//!
//! Peers talk JSON-RPC 2.0 to each other, one JSON document per line over
//! plain TCP. This crate contains:
//!
//! - **Protocol Layer**: envelopes, message classification, request/response
//!   correlation, method dispatch and the error taxonomy
//! - **Transport Layer**: line framing, outbound TCP links with timeouts, and
//!   a server that answers requests
//! - **Identity**: [`PeerAddress`], [`ClientId`] and optional Ed25519 peer
//!   authentication in [`signer`]
//!
//! # Wire Format
//!
//! - **Transport**: TCP, one connection per client/peer pair
//! - **Serialization**: compact JSON, UTF-8
//! - **Framing**: `\n` after every message
//! - **Max Line Size**: 16 MB
//!
//! # Example
//!
//! ```
//! use peerlink_common::protocol::{Dispatcher, JsonRpcRequest};
//! use serde_json::json;
//!
//! let dispatcher = Dispatcher::new().with_method("echo", |params| Ok(params));
//! let request = JsonRpcRequest::new(7, "echo", json!("hi"));
//!
//! let response = dispatcher.handle_request(request);
//! assert_eq!(
//!     serde_json::to_string(&response).unwrap(),
//!     r#"{"jsonrpc":"2.0","result":"hi","id":7}"#
//! );
//! ```

pub mod peer;
pub mod protocol;
pub mod signer;
pub mod transport;

pub use peer::{ClientId, PeerAddress};
pub use protocol::*;

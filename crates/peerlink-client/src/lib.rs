//! Client side of peerlink.
//!
//! [`Connection`] speaks line-delimited JSON-RPC to one peer and fails over
//! to another peer from a shared [`PoolManager`](peerlink_manager::PoolManager)
//! when the current one stops answering.

pub mod config;
pub mod connection;
pub mod reconnect;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionState};
pub use reconnect::{ReconnectConfig, ReconnectPolicy, Recovered, RecoveryState};

pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod jsonrpc;
pub mod message;


pub use correlation::Correlator;
pub use dispatch::{Dispatcher, HandlerResult};
pub use error::{PeerlinkError, Result};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, ResponsePayload};
pub use message::Message;

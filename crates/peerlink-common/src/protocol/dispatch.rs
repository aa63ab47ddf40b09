//! Request dispatch.
//!
//! Maps method names to handlers and turns every received line into the
//! reply (if any) the receiving side owes its peer.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

use super::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use super::message::Message;

/// What a method handler hands back: a result value or a JSON-RPC error.
pub type HandlerResult = std::result::Result<Value, JsonRpcError>;

type Handler = Box<dyn Fn(Value) -> HandlerResult + Send + Sync>;

/// Method table used by [`PeerServer`](crate::transport::PeerServer) and by
/// clients answering requests that arrive on their own link.
///
/// # Example
///
/// ```
/// use peerlink_common::protocol::Dispatcher;
/// use serde_json::json;
///
/// let dispatcher = Dispatcher::new().with_method("echo", |params| Ok(params));
///
/// let reply = dispatcher
///     .handle_line(br#"{"jsonrpc":"2.0","method":"echo","params":"hi","id":7}"#)
///     .unwrap();
/// assert_eq!(reply.result(), Some(&json!("hi")));
/// ```
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method`, replacing any previous one.
    pub fn register<F>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.insert(method.into(), Box::new(handler));
        self
    }

    pub fn with_method<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(method, handler);
        self
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Runs the handler for `request` and wraps its outcome.
    pub fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        match self.handlers.get(&request.method) {
            Some(handler) => match handler(request.params) {
                Ok(result) => JsonRpcResponse::success(request.id, result),
                Err(err) => JsonRpcResponse::error(Some(request.id), err),
            },
            None => {
                debug!(method = %request.method, "Unknown method");
                JsonRpcResponse::error(Some(request.id), JsonRpcError::method_not_found())
            }
        }
    }

    /// Handles one classified message.
    ///
    /// Responses are never answered; they belong to whoever sent the matching
    /// request.
    pub fn handle_message(&self, message: Message) -> Option<JsonRpcResponse> {
        match message {
            Message::Request(request) => Some(self.handle_request(request)),
            Message::Response(response) => {
                debug!(id = ?response.id, "Dispatcher ignoring response");
                None
            }
        }
    }

    /// Handles one raw line. Lines that are not a request or a response get
    /// an Invalid Request error with a null id.
    pub fn handle_line(&self, line: &[u8]) -> Option<JsonRpcResponse> {
        match Message::from_slice(line) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                warn!("Rejecting line: {}", e);
                Some(JsonRpcResponse::invalid_request())
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("methods", &self.methods())
            .finish()
    }
}

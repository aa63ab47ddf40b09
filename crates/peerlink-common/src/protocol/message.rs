//! Message classification.
//!
//! A decoded line is either a request or a response. Anything else is
//! answered with an Invalid Request error by the receiver.

use serde::Serialize;
use serde_json::Value;

use super::error::{PeerlinkError, Result};
use super::jsonrpc::{JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION};

/// One JSON-RPC envelope travelling over a peer link.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl Message {
    /// Decodes and classifies one line (without its delimiter).
    pub fn from_slice(line: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(line)
            .map_err(|e| PeerlinkError::InvalidMessage(format!("not valid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Classifies an already parsed JSON document.
    ///
    /// Requests need `jsonrpc`, `method`, `params` and a non-null `id`.
    /// Responses need `jsonrpc`, `id` and exactly one of `result` or
    /// `error`; a `null` id is only accepted on error responses.
    pub fn from_value(value: Value) -> Result<Self> {
        let (is_request, has_result, has_error) = {
            let obj = value
                .as_object()
                .ok_or_else(|| invalid("expected a JSON object"))?;

            match obj.get("jsonrpc") {
                Some(Value::String(version)) if version == JSONRPC_VERSION => {}
                _ => return Err(invalid("missing or unsupported jsonrpc version")),
            }
            if !obj.contains_key("id") {
                return Err(invalid("missing id (notifications are not supported)"));
            }

            let is_request = obj.contains_key("method");
            if is_request && !obj.contains_key("params") {
                return Err(invalid("request without params"));
            }
            (is_request, obj.contains_key("result"), obj.contains_key("error"))
        };

        if is_request {
            let request: JsonRpcRequest =
                serde_json::from_value(value).map_err(|e| invalid(&e.to_string()))?;
            return Ok(Message::Request(request));
        }

        match (has_result, has_error) {
            (true, true) => Err(invalid("response carries both result and error")),
            (false, false) => Err(invalid("neither a request nor a response")),
            _ => {
                let response: JsonRpcResponse =
                    serde_json::from_value(value).map_err(|e| invalid(&e.to_string()))?;
                if response.id.is_none() && response.is_success() {
                    return Err(invalid("success response with null id"));
                }
                Ok(Message::Response(response))
            }
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(req) => Some(&req.id),
            Message::Response(res) => res.id.as_ref(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }
}

impl From<JsonRpcRequest> for Message {
    fn from(request: JsonRpcRequest) -> Self {
        Message::Request(request)
    }
}

impl From<JsonRpcResponse> for Message {
    fn from(response: JsonRpcResponse) -> Self {
        Message::Response(response)
    }
}

fn invalid(reason: &str) -> PeerlinkError {
    PeerlinkError::InvalidMessage(reason.to_string())
}

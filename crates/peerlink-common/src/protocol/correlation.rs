use std::collections::{HashMap, HashSet};

use super::error::{PeerlinkError, Result};
use super::jsonrpc::{JsonRpcResponse, RequestId};

/// Tracks request ids a side has issued and not yet seen answered.
///
/// Responses are matched by id, never by arrival order. A response that
/// arrives for somebody else's request is parked until its owner asks for it.
#[derive(Debug)]
pub struct Correlator {
    next_id: i64,
    outstanding: HashSet<RequestId>,
    parked: HashMap<RequestId, JsonRpcResponse>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            outstanding: HashSet::new(),
            parked: HashMap::new(),
        }
    }

    /// Returns a numeric id not currently outstanding.
    pub fn next_id(&mut self) -> RequestId {
        loop {
            let id = RequestId::Number(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.outstanding.contains(&id) && !self.parked.contains_key(&id) {
                return id;
            }
        }
    }

    /// Marks `id` as sent and awaiting a response.
    pub fn register(&mut self, id: RequestId) -> Result<()> {
        if self.outstanding.contains(&id) || self.parked.contains_key(&id) {
            return Err(PeerlinkError::DuplicateRequestId(id));
        }
        self.outstanding.insert(id);
        Ok(())
    }

    /// Withdraws an id whose request never made it onto the wire.
    pub fn forget(&mut self, id: &RequestId) {
        self.outstanding.remove(id);
    }

    /// Matches a response against the outstanding set and retires its id.
    pub fn resolve(&mut self, response: &JsonRpcResponse) -> Result<()> {
        match &response.id {
            Some(id) if self.outstanding.remove(id) => Ok(()),
            Some(id) => Err(PeerlinkError::UnmatchedResponse(id.to_string())),
            None => Err(PeerlinkError::UnmatchedResponse("null".to_string())),
        }
    }

    /// Holds a resolved response for a different waiter.
    pub fn park(&mut self, response: JsonRpcResponse) {
        if let Some(id) = response.id.clone() {
            self.parked.insert(id, response);
        }
    }

    pub fn take_parked(&mut self, id: &RequestId) -> Option<JsonRpcResponse> {
        self.parked.remove(id)
    }

    pub fn is_outstanding(&self, id: &RequestId) -> bool {
        self.outstanding.contains(id)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Drops every outstanding id and returns them.
    ///
    /// Called when the link is replaced: requests written to the old socket
    /// can no longer be answered.
    pub fn reset(&mut self) -> Vec<RequestId> {
        self.outstanding.drain().collect()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

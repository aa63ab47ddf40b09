// Copyright 2025 Peerlink Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::{HashMap, VecDeque};

use peerlink_common::{ClientId, PeerAddress};

/// FIFO pool of unassigned peers plus the client assignment table.
///
/// Not synchronized; [`PoolManager`](crate::PoolManager) wraps it in a lock.
#[derive(Debug, Default)]
pub struct PeerPool {
    peers: VecDeque<PeerAddress>,
    assignments: HashMap<ClientId, PeerAddress>,
}

impl PeerPool {
    /// Create a pool from an initial peer list, dropping duplicates
    pub fn new(peers: Vec<PeerAddress>) -> Self {
        let mut pool = Self::default();
        for peer in peers {
            pool.add_peer(peer);
        }
        pool
    }

    /// Append a peer to the back of the pool. Returns `false` if it was
    /// already queued.
    pub fn add_peer(&mut self, peer: PeerAddress) -> bool {
        if self.peers.contains(&peer) {
            return false;
        }
        self.peers.push_back(peer);
        true
    }

    /// Remove a peer from the pool. Assignments are left alone.
    pub fn remove_peer(&mut self, peer: &PeerAddress) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p != peer);
        self.peers.len() != before
    }

    /// Take the first queued peer not held by another client and assign it
    /// to `client`, replacing any previous assignment.
    pub fn allocate(&mut self, client: ClientId) -> Option<PeerAddress> {
        let index = self
            .peers
            .iter()
            .position(|peer| self.holder_of(peer).map_or(true, |holder| holder == client))?;
        let peer = self.peers.remove(index)?;
        self.assignments.insert(client, peer.clone());
        Some(peer)
    }

    /// Drop the assignment of `client`, if any
    pub fn release(&mut self, client: ClientId) -> Option<PeerAddress> {
        self.assignments.remove(&client)
    }

    pub fn assignment_of(&self, client: ClientId) -> Option<PeerAddress> {
        self.assignments.get(&client).cloned()
    }

    fn holder_of(&self, peer: &PeerAddress) -> Option<ClientId> {
        self.assignments
            .iter()
            .find_map(|(client, assigned)| (assigned == peer).then_some(*client))
    }

    /// Get the number of queued peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Get the number of clients holding a peer
    pub fn client_count(&self) -> usize {
        self.assignments.len()
    }

    /// Queued peers, head first
    pub fn peers(&self) -> Vec<PeerAddress> {
        self.peers.iter().cloned().collect()
    }

    /// Current assignments ordered by client id
    pub fn assignments(&self) -> Vec<(ClientId, PeerAddress)> {
        let mut entries: Vec<_> = self
            .assignments
            .iter()
            .map(|(client, peer)| (*client, peer.clone()))
            .collect();
        entries.sort_by_key(|(client, _)| *client);
        entries
    }
}

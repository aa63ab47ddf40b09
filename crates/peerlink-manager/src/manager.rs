use peerlink_common::protocol::error::{PeerlinkError, Result};
use peerlink_common::{ClientId, PeerAddress};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::pool::PeerPool;

/// Peerlink pool manager.
///
/// Hands out peers to clients, remembers which client holds which peer and
/// forgets a client when it reports permanent failure.
///
/// # Concurrency
///
/// Cloning is cheap and every clone shares the same state. All operations
/// run under one lock that is held only for the duration of the call and
/// never across I/O, so the manager is safe to use from any task or thread
/// (including `Drop` impls).
///
/// # Introspection
///
/// `list_*`, `*_count` and `assignment_of` return snapshots. Other clients
/// may change the state right after; use them for observability, not to
/// decide whether an `allocate` will succeed.
///
/// # Example
/// ```
/// use peerlink_manager::PoolManager;
/// use peerlink_common::{ClientId, PeerAddress};
///
/// let manager = PoolManager::new();
/// manager.add_peer("10.0.0.1", 9001);
/// manager.add_peer("10.0.0.2", 9001);
///
/// let client = ClientId::next();
/// let peer = manager.allocate(client).unwrap();
/// assert_eq!(peer, PeerAddress::new("10.0.0.1", 9001));
/// assert_eq!(manager.assignment_of(client), Some(peer));
/// ```
#[derive(Debug, Clone, Default)]
pub struct PoolManager {
    pool: Arc<Mutex<PeerPool>>,
}

impl PoolManager {
    /// Creates a manager with an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager seeded with `peers` (duplicates are dropped).
    pub fn with_peers(peers: Vec<PeerAddress>) -> Self {
        Self {
            pool: Arc::new(Mutex::new(PeerPool::new(peers))),
        }
    }

    // every pool mutation is a single collection call, so a poisoned
    // guard still holds a consistent pool
    fn lock(&self) -> MutexGuard<'_, PeerPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a peer to the back of the pool.
    ///
    /// Duplicates are ignored.
    ///
    /// # Returns
    /// `true` if the peer was added
    pub fn add_peer(&self, host: &str, port: u16) -> bool {
        self.add(PeerAddress::new(host, port))
    }

    pub fn add(&self, peer: PeerAddress) -> bool {
        let added = self.lock().add_peer(peer.clone());
        if added {
            debug!("Added peer {} to pool", peer);
        } else {
            debug!("Peer {} already in pool", peer);
        }
        added
    }

    /// Removes a peer from the pool.
    ///
    /// Clients already assigned to it keep their assignment. Removing an
    /// absent peer is a no-op.
    pub fn remove_peer(&self, host: &str, port: u16) -> bool {
        self.remove(&PeerAddress::new(host, port))
    }

    pub fn remove(&self, peer: &PeerAddress) -> bool {
        let removed = self.lock().remove_peer(peer);
        if removed {
            debug!("Removed peer {} from pool", peer);
        }
        removed
    }

    /// Assigns the next free peer to `client`.
    ///
    /// The peer leaves the pool and is recorded as `client`'s assignment,
    /// overwriting any earlier one. It does not return to the pool on its
    /// own; callers that abandon it must [`add`](Self::add) it back.
    ///
    /// # Returns
    /// - `Ok(peer)` - Peer assigned to `client`
    /// - `Err(PeerlinkError::PoolExhausted)` - No free peer left
    pub fn allocate(&self, client: ClientId) -> Result<PeerAddress> {
        let allocated = self.lock().allocate(client);
        match allocated {
            Some(peer) => {
                info!("Allocated peer {} to {}", peer, client);
                Ok(peer)
            }
            None => {
                warn!("No free peer left for {}", client);
                Err(PeerlinkError::PoolExhausted)
            }
        }
    }

    /// Drops `client`'s assignment. No-op for unknown clients.
    pub fn release(&self, client: ClientId) -> Option<PeerAddress> {
        let released = self.lock().release(client);
        if let Some(peer) = &released {
            debug!("Released {} from {}", client, peer);
        }
        released
    }

    /// Records that `client` failed permanently and forgets its assignment.
    pub fn handle_client_failure(&self, client: ClientId) -> Option<PeerAddress> {
        let released = self.lock().release(client);
        match &released {
            Some(peer) => info!("Dropped {} after permanent failure on {}", client, peer),
            None => warn!("Failure reported for unknown client {}", client),
        }
        released
    }

    /// Snapshot of the unassigned peers, head first.
    pub fn list_available_peers(&self) -> Vec<PeerAddress> {
        self.lock().peers()
    }

    /// Snapshot of the assignment table, ordered by client id.
    pub fn list_active_clients(&self) -> Vec<(ClientId, PeerAddress)> {
        self.lock().assignments()
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peer_count()
    }

    pub fn client_count(&self) -> usize {
        self.lock().client_count()
    }

    pub fn assignment_of(&self, client: ClientId) -> Option<PeerAddress> {
        self.lock().assignment_of(client)
    }
}

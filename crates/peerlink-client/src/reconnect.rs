use peerlink_common::protocol::error::{PeerlinkError, Result};
use peerlink_common::{ClientId, PeerAddress};
use peerlink_manager::PoolManager;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// Configuration for reconnecting with exponential backoff.
///
/// A failed link is retried against the same peer up to `max_retries` times,
/// waiting between attempts. When every attempt fails the client asks the
/// pool manager for a different peer and starts over with the same budget.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Connection attempts against one peer before asking for another
    ///
    /// Default: 5
    pub max_retries: u32,
    /// Wait before the second attempt against a peer
    ///
    /// Default: 50ms
    pub initial_backoff_ms: u64,
    /// Upper bound for the wait between attempts
    ///
    /// Default: 5000ms (5 seconds)
    pub max_backoff_ms: u64,
    /// Each wait is the previous one times this factor
    ///
    /// Default: 2.0 (doubles each time)
    pub backoff_multiplier: f64,
    /// Randomize each wait uniformly within `[d/2, d]`
    ///
    /// Default: true
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(PeerlinkError::InvalidConfig("max_retries must be at least 1".into()));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(PeerlinkError::InvalidConfig(format!(
                "backoff_multiplier must be a finite value >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(PeerlinkError::InvalidConfig(format!(
                "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }

    /// Un-jittered wait before retry number `retry` (1-based) against one peer.
    pub fn backoff(&self, retry: u32) -> Duration {
        let mut backoff_ms = self.initial_backoff_ms;
        for _ in 1..retry {
            backoff_ms = ((backoff_ms as f64 * self.backoff_multiplier) as u64).min(self.max_backoff_ms);
        }
        Duration::from_millis(backoff_ms.min(self.max_backoff_ms))
    }

    fn jittered(&self, base: Duration) -> Duration {
        if !self.jitter {
            return base;
        }
        let max = base.as_millis() as u64;
        if max == 0 {
            return base;
        }
        Duration::from_millis(rand::rng().random_range(max / 2..=max))
    }
}

/// Where a recovery cycle currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryState {
    Idle,
    /// Attempt `attempt` (1-based) against `target`
    Retrying { target: PeerAddress, attempt: u32 },
    /// Same-peer budget spent, waiting on the pool manager
    RequestingNewPeer,
    /// The pool had nothing left; no further automatic attempts
    PermanentlyFailed,
}

/// Outcome of a successful recovery.
#[derive(Debug)]
pub struct Recovered<T> {
    pub link: T,
    pub target: PeerAddress,
    /// Connection attempts made, including the successful one
    pub attempts: u32,
    /// Whether the pool manager supplied a different peer
    pub replaced: bool,
}

/// Drives one recovery cycle for one client.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    manager: PoolManager,
    client: ClientId,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig, manager: PoolManager, client: ClientId) -> Self {
        Self {
            config,
            manager,
            client,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Re-establishes a link, starting with `target`.
    ///
    /// `connect` opens one link to the given peer. Transient failures are
    /// retried with backoff; after `max_retries` failures against a peer the
    /// pool manager is asked for a replacement. Each state change is reported
    /// to `observe`.
    ///
    /// # Errors
    ///
    /// - [`PeerlinkError::PermanentFailure`] when the pool is exhausted; the
    ///   manager has already been told to drop this client
    /// - any non-transient error from `connect`, returned as is
    pub async fn recover<T, F, Fut, O>(&self, target: PeerAddress, mut connect: F, mut observe: O) -> Result<Recovered<T>>
    where
        F: FnMut(PeerAddress) -> Fut,
        Fut: Future<Output = Result<T>>,
        O: FnMut(&RecoveryState),
    {
        let mut target = target;
        let mut attempts = 0u32;
        let mut replaced = false;

        loop {
            for attempt in 1..=self.config.max_retries {
                observe(&RecoveryState::Retrying {
                    target: target.clone(),
                    attempt,
                });
                if attempt > 1 {
                    let wait = self.config.jittered(self.config.backoff(attempt - 1));
                    tokio::time::sleep(wait).await;
                }

                attempts += 1;
                match connect(target.clone()).await {
                    Ok(link) => {
                        observe(&RecoveryState::Idle);
                        info!("{} connected to {} after {} attempt(s)", self.client, target, attempts);
                        return Ok(Recovered {
                            link,
                            target,
                            attempts,
                            replaced,
                        });
                    }
                    Err(e) if !e.is_transient() => {
                        observe(&RecoveryState::Idle);
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(
                            "{} attempt {}/{} against {} failed: {}",
                            self.client, attempt, self.config.max_retries, target, e
                        );
                    }
                }
            }

            observe(&RecoveryState::RequestingNewPeer);
            match self.manager.allocate(self.client) {
                Ok(next) => {
                    info!("{} giving up on {}, switching to {}", self.client, target, next);
                    target = next;
                    replaced = true;
                }
                Err(e) => {
                    observe(&RecoveryState::PermanentlyFailed);
                    self.manager.handle_client_failure(self.client);
                    error!("{} has no peer left after {} attempts: {}", self.client, attempts, e);
                    return Err(PeerlinkError::PermanentFailure {
                        client: self.client,
                        attempts,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn fast_config(max_retries: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn refused(peer: &PeerAddress) -> PeerlinkError {
        PeerlinkError::Connection(format!("Failed to connect to {}: refused", peer))
    }

    #[test]
    fn test_default_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_backoff_ms, 50);
        assert_eq!(config.max_backoff_ms, 5000);
        assert_eq!(config.backoff_multiplier, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_exponential_backoff_calculation() {
        let config = ReconnectConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(50));
        assert_eq!(config.backoff(2), Duration::from_millis(100));
        assert_eq!(config.backoff(3), Duration::from_millis(200));
        assert_eq!(config.backoff(10), Duration::from_millis(5000));
        assert_eq!(config.backoff(100), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = ReconnectConfig::default();
        for _ in 0..200 {
            let wait = config.jittered(Duration::from_millis(100));
            assert!(wait >= Duration::from_millis(50) && wait <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = ReconnectConfig::default();
        config.max_retries = 0;
        assert!(config.validate().unwrap_err().is_fatal());

        let mut config = ReconnectConfig::default();
        config.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = ReconnectConfig::default();
        config.initial_backoff_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_exactly_max_retries_then_permanent_failure() {
        let manager = PoolManager::new();
        let client = ClientId::next();
        let policy = ReconnectPolicy::new(fast_config(3), manager.clone(), client);
        let calls = RefCell::new(Vec::new());
        let states = RefCell::new(Vec::new());

        let result = policy
            .recover(
                PeerAddress::new("127.0.0.1", 1),
                |peer| {
                    calls.borrow_mut().push(peer.clone());
                    async move { Err::<(), _>(refused(&peer)) }
                },
                |state| states.borrow_mut().push(state.clone()),
            )
            .await;

        match result {
            Err(PeerlinkError::PermanentFailure { client: c, attempts }) => {
                assert_eq!(c, client);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected permanent failure, got {:?}", other.map(|_| ())),
        }
        assert_eq!(calls.borrow().len(), 3);
        assert_eq!(states.borrow().last(), Some(&RecoveryState::PermanentlyFailed));
        assert_eq!(manager.assignment_of(client), None);
    }

    #[tokio::test]
    async fn test_failover_to_replacement_peer() {
        let bad = PeerAddress::new("10.0.0.1", 1);
        let good = PeerAddress::new("10.0.0.2", 2);
        let manager = PoolManager::with_peers(vec![good.clone()]);
        let client = ClientId::next();
        let policy = ReconnectPolicy::new(fast_config(2), manager.clone(), client);
        let calls = RefCell::new(Vec::new());

        let recovered = policy
            .recover(
                bad.clone(),
                |peer| {
                    calls.borrow_mut().push(peer.clone());
                    let ok = peer.port() == 2;
                    async move {
                        if ok {
                            Ok(peer.port())
                        } else {
                            Err(refused(&peer))
                        }
                    }
                },
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(recovered.link, 2);
        assert_eq!(recovered.target, good);
        assert_eq!(recovered.attempts, 3);
        assert!(recovered.replaced);
        assert_eq!(*calls.borrow(), vec![bad.clone(), bad, good.clone()]);
        assert_eq!(manager.assignment_of(client), Some(good));
    }

    #[tokio::test]
    async fn test_retry_succeeds_without_replacement() {
        let manager = PoolManager::with_peers(vec![PeerAddress::new("spare", 1)]);
        let policy = ReconnectPolicy::new(fast_config(5), manager.clone(), ClientId::next());
        let calls = RefCell::new(0u32);

        let recovered = policy
            .recover(
                PeerAddress::new("flaky", 1),
                |peer| {
                    *calls.borrow_mut() += 1;
                    let n = *calls.borrow();
                    async move {
                        if n < 3 {
                            Err(PeerlinkError::Timeout(10))
                        } else {
                            Ok(peer)
                        }
                    }
                },
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(recovered.attempts, 3);
        assert!(!recovered.replaced);
        // the spare stays untouched
        assert_eq!(manager.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_non_transient_error_aborts() {
        let policy = ReconnectPolicy::new(fast_config(5), PoolManager::new(), ClientId::next());
        let calls = RefCell::new(0u32);

        let result = policy
            .recover(
                PeerAddress::new("x", 1),
                |_| {
                    *calls.borrow_mut() += 1;
                    async { Err::<(), _>(PeerlinkError::InvalidConfig("bad host".into())) }
                },
                |_| {},
            )
            .await;

        assert!(matches!(result, Err(PeerlinkError::InvalidConfig(_))));
        assert_eq!(*calls.borrow(), 1);
    }
}

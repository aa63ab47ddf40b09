//! Client connection to one peer at a time.
//!
//! A [`Connection`] owns a single TCP link and recovers it transparently:
//! a failed send or receive retries the current peer with backoff, then asks
//! the [`PoolManager`] for a replacement, and only surfaces
//! [`PeerlinkError::PermanentFailure`] once the pool is empty.
//!
//! # Locking
//!
//! The link sits behind an async mutex held for the whole of one send or
//! receive, so lines never interleave. Bookkeeping (state, target, request
//! correlation) sits behind a plain mutex that is never held across an
//! await. [`close`](Connection::close) first wakes whichever operation holds
//! the link, then tears the socket down.
//!
//! # In-flight requests
//!
//! When a link is replaced, requests written to the old socket are not
//! replayed. [`call`](Connection::call) fails with
//! [`PeerlinkError::RequestLost`]; ids sent through [`send`](Connection::send)
//! are reported by [`take_lost_requests`](Connection::take_lost_requests).

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use peerlink_common::protocol::error::{PeerlinkError, Result};
use peerlink_common::protocol::{Correlator, JsonRpcRequest, JsonRpcResponse, Message, RequestId};
use peerlink_common::signer::{hello_params, verify_hello, Verifier, HELLO_METHOD, NONCE_LEN};
use peerlink_common::transport::{JsonLineCodec, LineStream, TcpTransport};
use peerlink_common::{ClientId, PeerAddress};
use peerlink_manager::PoolManager;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::reconnect::{ReconnectPolicy, RecoveryState, Recovered};

/// Whether a connection currently holds an open link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

struct Session {
    target: PeerAddress,
    state: ConnectionState,
    /// connection attempts since the last established link
    attempts: u32,
    last_io: Instant,
    recovery: RecoveryState,
    closing: bool,
    correlator: Correlator,
    /// ids `call` is waiting on; their responses get parked, not returned
    awaited: HashSet<RequestId>,
    /// messages read on behalf of someone else, handed out by `receive`
    inbox: VecDeque<Message>,
    lost: Vec<RequestId>,
}

/// A JSON-RPC link to one peer with automatic failover.
///
/// # Example
///
/// ```no_run
/// use peerlink_client::{Connection, ConnectionConfig};
/// use peerlink_manager::PoolManager;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = PoolManager::new();
/// manager.add_peer("127.0.0.1", 9001);
/// manager.add_peer("127.0.0.1", 9002);
///
/// let conn = Connection::from_pool(manager, ConnectionConfig::default())?;
/// let response = conn.call("echo", json!("hi")).await?;
/// assert_eq!(response.result(), Some(&json!("hi")));
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    id: ClientId,
    manager: PoolManager,
    transport: TcpTransport,
    policy: ReconnectPolicy,
    link: tokio::sync::Mutex<Option<LineStream>>,
    session: Mutex<Session>,
    closed_tx: watch::Sender<u64>,
}

impl Connection {
    /// Creates a disconnected connection aimed at `target`.
    ///
    /// The target is not recorded with the manager; only peers handed out by
    /// [`PoolManager::allocate`] are.
    pub fn new(manager: PoolManager, target: PeerAddress, config: ConnectionConfig) -> Result<Self> {
        Self::build(ClientId::next(), manager, target, config)
    }

    /// Creates a disconnected connection aimed at the next free pool peer.
    pub fn from_pool(manager: PoolManager, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let id = ClientId::next();
        let target = manager.allocate(id)?;
        Self::build(id, manager, target, config)
    }

    fn build(id: ClientId, manager: PoolManager, target: PeerAddress, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let transport = TcpTransport::new(config.timeout).with_max_line(config.max_line_size);
        let policy = ReconnectPolicy::new(config.reconnect, manager.clone(), id);
        let (closed_tx, _) = watch::channel(0u64);

        debug!("{} created for {}", id, target);

        Ok(Self {
            id,
            manager,
            transport,
            policy,
            link: tokio::sync::Mutex::new(None),
            session: Mutex::new(Session {
                target,
                state: ConnectionState::Disconnected,
                attempts: 0,
                last_io: Instant::now(),
                recovery: RecoveryState::Idle,
                closing: false,
                correlator: Correlator::new(),
                awaited: HashSet::new(),
                inbox: VecDeque::new(),
                lost: Vec::new(),
            }),
            closed_tx,
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Opens one link to the current target. No retries.
    pub async fn connect(&self) -> Result<()> {
        let target = self.target();
        self.connect_to(target).await
    }

    /// Opens one link to `target`, which becomes the current target.
    ///
    /// Any previous link is closed first. Also clears a permanent failure.
    pub async fn connect_to(&self, target: PeerAddress) -> Result<()> {
        let mut closed = self.closed_tx.subscribe();
        let mut link = self.link.lock().await;
        self.check_open()?;

        if link.is_some() {
            self.drop_link(&mut link);
        }
        {
            let mut session = self.session();
            session.target = target.clone();
            session.recovery = RecoveryState::Idle;
        }

        let opened = tokio::select! {
            opened = self.transport.connect(&target) => opened,
            _ = closed.changed() => Err(PeerlinkError::Closed),
        };

        match opened {
            Ok(stream) => {
                *link = Some(stream);
                self.mark_connected(&target);
                info!("{} connected to {}", self.id, target);
                Ok(())
            }
            Err(e) => {
                let mut session = self.session();
                session.state = ConnectionState::Disconnected;
                session.attempts += 1;
                Err(e)
            }
        }
    }

    /// Shuts the link down. Idempotent.
    ///
    /// A send or receive blocked on this connection returns
    /// [`PeerlinkError::Closed`]. Later operations reconnect as usual.
    pub async fn close(&self) {
        {
            let mut session = self.session();
            session.closing = true;
            session.state = ConnectionState::Disconnected;
        }
        self.closed_tx.send_modify(|epoch| *epoch = epoch.wrapping_add(1));

        let mut link = self.link.lock().await;
        if let Some(mut stream) = link.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("{} shutdown of {} failed: {}", self.id, self.target(), e);
            }
            info!("{} closed link to {}", self.id, self.target());
        }
        self.drop_link(&mut link);
        self.session().closing = false;
    }

    /// Closes the link and gives the assigned peer up.
    pub async fn release(&self) {
        self.close().await;
        self.manager.release(self.id);
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Writes one message, reconnecting first if needed.
    ///
    /// A request's id must not be outstanding on this connection. If the
    /// write fails, the link is recovered once and the same line written
    /// again.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let line = JsonLineCodec::encode(message)?;
        let request_id = match message {
            Message::Request(request) => {
                self.session().correlator.register(request.id.clone())?;
                Some(&request.id)
            }
            Message::Response(_) => None,
        };

        let sent = self.send_line(&line, request_id).await;
        if sent.is_err() {
            if let Some(id) = request_id {
                let mut session = self.session();
                session.correlator.forget(id);
                session.lost.retain(|lost| lost != id);
            }
        }
        sent
    }

    /// Answers a request received through [`receive`](Self::receive).
    pub async fn respond(&self, response: JsonRpcResponse) -> Result<()> {
        self.send(&Message::Response(response)).await
    }

    /// Reads the next request or response from the peer.
    ///
    /// Lines that are not valid messages are answered with Invalid Request
    /// and skipped; responses matching no outstanding request are dropped.
    /// Returns `Ok(None)` when the peer closed the link cleanly.
    pub async fn receive(&self) -> Result<Option<Message>> {
        let queued = self.session().inbox.pop_front();
        if let Some(message) = queued {
            return Ok(Some(message));
        }
        self.next_message(None).await
    }

    /// Sends a request with a fresh id and waits for its response.
    ///
    /// Responses to other requests and incoming requests read meanwhile are
    /// kept for their owners and for [`receive`](Self::receive).
    pub async fn call(&self, method: &str, params: Value) -> Result<JsonRpcResponse> {
        let id = {
            let mut session = self.session();
            let id = session.correlator.next_id();
            session.correlator.register(id.clone())?;
            session.awaited.insert(id.clone());
            id
        };

        let request = JsonRpcRequest::new(id.clone(), method, params);
        let outcome = self.await_response(&request).await;

        {
            let mut session = self.session();
            session.awaited.remove(&id);
            session.lost.retain(|lost| lost != &id);
            if outcome.is_err() {
                session.correlator.forget(&id);
                session.correlator.take_parked(&id);
            }
        }
        outcome
    }

    async fn await_response(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let line = JsonLineCodec::encode_request(request)?;
        self.send_line(&line, Some(&request.id)).await?;
        debug!("{} sent {} as request {}", self.id, request.method, request.id);

        loop {
            match self.next_message(Some(&request.id)).await? {
                Some(Message::Response(response)) if response.id.as_ref() == Some(&request.id) => {
                    return Ok(response);
                }
                Some(other) => self.session().inbox.push_back(other),
                None => {
                    return Err(PeerlinkError::Connection(format!(
                        "peer closed the link before answering request {}",
                        request.id
                    )))
                }
            }
        }
    }

    /// Verifies the peer's identity with a `peer.hello` handshake.
    ///
    /// With `trusted` set, the peer's key must also be on the list.
    ///
    /// # Returns
    /// The peer's Ed25519 public key
    pub async fn authenticate(&self, verifier: &dyn Verifier, trusted: Option<&[[u8; 32]]>) -> Result<[u8; 32]> {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let response = self.call(HELLO_METHOD, hello_params(&nonce)).await?;
        let result = response
            .into_result()
            .map_err(|e| PeerlinkError::Signature(format!("peer rejected handshake: {}", e)))?;

        let key = verify_hello(verifier, &nonce, &result)?;
        if let Some(trusted) = trusted {
            if !trusted.contains(&key) {
                return Err(PeerlinkError::Signature(format!("key {} is not trusted", hex::encode(key))));
            }
        }

        info!("{} authenticated {} as {}", self.id, self.target(), hex::encode(key));
        Ok(key)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn target(&self) -> PeerAddress {
        self.session().target.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.session().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connection attempts since the last established link.
    pub fn attempts(&self) -> u32 {
        self.session().attempts
    }

    /// Time since the last successful read or write.
    pub fn idle_time(&self) -> Duration {
        self.session().last_io.elapsed()
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.session().recovery.clone()
    }

    /// Requests sent and not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.session().correlator.outstanding()
    }

    /// Ids of requests sent with [`send`](Self::send) that were in flight
    /// when their link was replaced or closed.
    pub fn take_lost_requests(&self) -> Vec<RequestId> {
        std::mem::take(&mut self.session().lost)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self) -> Result<()> {
        if self.session().closing {
            return Err(PeerlinkError::Closed);
        }
        Ok(())
    }

    /// Fails fast while closing or after the pool ran dry.
    fn check_usable(&self) -> Result<()> {
        let session = self.session();
        if session.closing {
            return Err(PeerlinkError::Closed);
        }
        if session.recovery == RecoveryState::PermanentlyFailed {
            return Err(PeerlinkError::PermanentFailure {
                client: self.id,
                attempts: session.attempts,
            });
        }
        Ok(())
    }

    fn mark_connected(&self, target: &PeerAddress) {
        let mut session = self.session();
        session.target = target.clone();
        session.state = ConnectionState::Connected;
        session.attempts = 0;
        session.last_io = Instant::now();
        session.recovery = RecoveryState::Idle;
    }

    fn touch(&self) {
        self.session().last_io = Instant::now();
    }

    /// Drops the current link and writes off every request sent on it.
    fn drop_link(&self, link: &mut Option<LineStream>) {
        link.take();
        let lost = {
            let mut session = self.session();
            session.state = ConnectionState::Disconnected;
            let lost = session.correlator.reset();
            session.lost.extend(lost.iter().cloned());
            lost
        };
        for id in lost {
            warn!("{} request {} lost with its link", self.id, id);
        }
    }

    /// Runs the reconnection policy if there is no link.
    async fn ensure_link(&self, link: &mut Option<LineStream>) -> Result<()> {
        if link.is_some() {
            return Ok(());
        }

        let transport = &self.transport;
        let recovered = self
            .policy
            .recover(
                self.target(),
                |peer| async move { transport.connect(&peer).await },
                |state| self.observe(state),
            )
            .await;

        match recovered {
            Ok(Recovered {
                link: stream,
                target,
                attempts,
                replaced,
            }) => {
                if replaced {
                    info!("{} failed over to {} ({} attempts)", self.id, target, attempts);
                }
                *link = Some(stream);
                self.mark_connected(&target);
                Ok(())
            }
            Err(e) => {
                self.session().state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    fn observe(&self, state: &RecoveryState) {
        let mut session = self.session();
        if let RecoveryState::Retrying { target, .. } = state {
            session.target = target.clone();
            session.attempts += 1;
        }
        session.recovery = state.clone();
    }

    async fn write(&self, link: &mut Option<LineStream>, line: &[u8]) -> Result<()> {
        let stream = link
            .as_mut()
            .ok_or_else(|| PeerlinkError::Connection("not connected".into()))?;
        stream.write_line(line).await?;
        self.touch();
        Ok(())
    }

    async fn send_line(&self, line: &[u8], request_id: Option<&RequestId>) -> Result<()> {
        let mut closed = self.closed_tx.subscribe();
        let mut link = self.link.lock().await;
        self.check_usable()?;

        tokio::select! {
            sent = self.write_recovering(&mut link, line, request_id) => sent,
            _ = closed.changed() => Err(PeerlinkError::Closed),
        }
    }

    async fn write_recovering(
        &self,
        link: &mut Option<LineStream>,
        line: &[u8],
        request_id: Option<&RequestId>,
    ) -> Result<()> {
        self.ensure_link(link).await?;
        let e = match self.write(link, line).await {
            Err(e) if e.is_transient() => e,
            other => return other,
        };

        warn!("{} write to {} failed: {}", self.id, self.target(), e);
        self.drop_link(link);
        if let Some(id) = request_id {
            // written again below, so not lost
            let mut session = self.session();
            session.lost.retain(|lost| lost != id);
            session.correlator.register(id.clone())?;
        }

        self.ensure_link(link).await?;
        let written = self.write(link, line).await;
        if matches!(&written, Err(e) if e.is_transient()) {
            self.drop_link(link);
        }
        written
    }

    /// Reads until a message for this caller shows up, recovering once.
    async fn next_message(&self, want: Option<&RequestId>) -> Result<Option<Message>> {
        let mut closed = self.closed_tx.subscribe();
        let mut link = self.link.lock().await;
        if let Some(id) = want {
            if let Some(response) = self.claim(id)? {
                return Ok(Some(Message::Response(response)));
            }
        }
        self.check_usable()?;

        tokio::select! {
            received = self.read_recovering(&mut link, want) => received,
            _ = closed.changed() => Err(PeerlinkError::Closed),
        }
    }

    async fn read_recovering(&self, link: &mut Option<LineStream>, want: Option<&RequestId>) -> Result<Option<Message>> {
        self.ensure_link(link).await?;
        let e = match self.pump(link, want).await {
            Err(e) if e.is_transient() => e,
            other => return other,
        };

        warn!("{} read from {} failed: {}", self.id, self.target(), e);
        self.drop_link(link);
        if let Some(id) = want {
            self.claim(id)?;
        }

        self.ensure_link(link).await?;
        let received = self.pump(link, want).await;
        if matches!(&received, Err(e) if e.is_transient()) {
            self.drop_link(link);
        }
        received
    }

    /// Takes a parked response for `id`, or fails if `id` was lost.
    fn claim(&self, id: &RequestId) -> Result<Option<JsonRpcResponse>> {
        let mut session = self.session();
        if let Some(response) = session.correlator.take_parked(id) {
            return Ok(Some(response));
        }
        if session.lost.contains(id) {
            return Err(PeerlinkError::RequestLost(id.clone()));
        }
        Ok(None)
    }

    /// Reads lines from the current link until one yields a message to hand
    /// back. No recovery here.
    async fn pump(&self, link: &mut Option<LineStream>, want: Option<&RequestId>) -> Result<Option<Message>> {
        loop {
            let stream = link
                .as_mut()
                .ok_or_else(|| PeerlinkError::Connection("not connected".into()))?;

            let line = match stream.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("{} peer {} closed the link", self.id, self.target());
                    if let Some(mut stream) = link.take() {
                        if let Err(e) = stream.shutdown().await {
                            debug!("{} shutdown of {} failed: {}", self.id, self.target(), e);
                        }
                    }
                    self.drop_link(link);
                    return Ok(None);
                }
                Err(PeerlinkError::MessageTooLarge(size)) => {
                    warn!("{} discarded {} bytes from {} without a delimiter", self.id, size, self.target());
                    reply_invalid(stream).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.touch();

            match Message::from_slice(&line) {
                Err(e) => {
                    warn!("{} rejecting line from {}: {}", self.id, self.target(), e);
                    reply_invalid(stream).await?;
                }
                Ok(Message::Request(request)) => return Ok(Some(Message::Request(request))),
                Ok(Message::Response(response)) => {
                    if let Some(response) = self.route(response, want) {
                        return Ok(Some(Message::Response(response)));
                    }
                }
            }
        }
    }

    /// Correlates a response. Returns it if the current caller should get it.
    fn route(&self, response: JsonRpcResponse, want: Option<&RequestId>) -> Option<JsonRpcResponse> {
        let mut session = self.session();
        if let Err(e) = session.correlator.resolve(&response) {
            warn!("{} dropping response: {}", self.id, e);
            return None;
        }

        let id = response.id.as_ref()?;
        if want == Some(id) {
            return Some(response);
        }
        if session.awaited.contains(id) {
            session.correlator.park(response);
            return None;
        }
        Some(response)
    }
}

async fn reply_invalid(stream: &mut LineStream) -> Result<()> {
    let reply = JsonLineCodec::encode_response(&JsonRpcResponse::invalid_request())?;
    stream.write_line(&reply).await
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.manager.release(self.id);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.session();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("target", &session.target)
            .field("state", &session.state)
            .field("recovery", &session.recovery)
            .finish()
    }
}

//! End-to-end tests for `Connection` against real loopback peers.

use std::sync::Arc;
use std::time::Duration;

use peerlink_client::{Connection, ConnectionConfig, ConnectionState, ReconnectConfig, RecoveryState};
use peerlink_common::protocol::error::PeerlinkError;
use peerlink_common::protocol::{Dispatcher, Message, RequestId};
use peerlink_common::signer::{
    hello_handler, Blake2bEd25519Signer, Blake2bEd25519Verifier, PayloadDigest, Signer, HELLO_METHOD,
};
use peerlink_common::transport::PeerServer;
use peerlink_common::PeerAddress;
use peerlink_manager::PoolManager;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

fn fast_config(max_retries: u32) -> ConnectionConfig {
    ConnectionConfig::default()
        .with_timeout(Duration::from_secs(2))
        .with_reconnect(ReconnectConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
            jitter: false,
        })
}

async fn start_server(dispatcher: Dispatcher) -> PeerAddress {
    let server = PeerServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.peer_address().unwrap();
    tokio::spawn(server.run(Arc::new(dispatcher)));
    addr
}

async fn start_echo_server() -> PeerAddress {
    start_server(Dispatcher::new().with_method("echo", Ok)).await
}

/// A loopback address nobody listens on.
async fn refused_peer() -> PeerAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = PeerAddress::from(listener.local_addr().unwrap());
    drop(listener);
    addr
}

#[tokio::test]
async fn test_echo_call() {
    let addr = start_echo_server().await;
    let manager = PoolManager::with_peers(vec![addr.clone()]);
    let conn = Connection::from_pool(manager.clone(), fast_config(3)).unwrap();

    let response = conn.call("echo", json!("hi")).await.unwrap();
    assert!(response.is_success());
    assert_eq!(response.result(), Some(&json!("hi")));
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.target(), addr);
    assert_eq!(conn.pending_requests(), 0);

    let response = conn.call("nope", json!([])).await.unwrap();
    assert_eq!(response.error_object().unwrap().code, -32601);
}

#[tokio::test]
async fn test_failover_to_next_pool_peer() {
    let dead = refused_peer().await;
    let live = start_echo_server().await;
    let manager = PoolManager::with_peers(vec![dead.clone(), live.clone()]);

    let conn = Connection::from_pool(manager.clone(), fast_config(2)).unwrap();
    assert_eq!(conn.target(), dead);

    let response = conn.call("echo", json!({"n": 1})).await.unwrap();
    assert_eq!(response.result(), Some(&json!({"n": 1})));
    assert_eq!(conn.target(), live);
    assert_eq!(conn.recovery_state(), RecoveryState::Idle);
    assert_eq!(conn.attempts(), 0);
    assert_eq!(manager.assignment_of(conn.id()), Some(live));
    assert_eq!(manager.peer_count(), 0);
}

#[tokio::test]
async fn test_permanent_failure_when_pool_runs_dry() {
    let dead = refused_peer().await;
    let manager = PoolManager::with_peers(vec![dead]);
    let conn = Connection::from_pool(manager.clone(), fast_config(3)).unwrap();
    assert_eq!(manager.client_count(), 1);

    match conn.call("echo", json!(1)).await {
        Err(PeerlinkError::PermanentFailure { client, attempts }) => {
            assert_eq!(client, conn.id());
            assert_eq!(attempts, 3);
        }
        other => panic!("expected permanent failure, got {:?}", other),
    }
    assert_eq!(conn.recovery_state(), RecoveryState::PermanentlyFailed);
    assert_eq!(manager.assignment_of(conn.id()), None);

    // no further automatic attempts
    let err = conn.send(&Message::from(peerlink_common::JsonRpcRequest::new(9, "echo", json!(1)))).await.unwrap_err();
    assert!(matches!(err, PeerlinkError::PermanentFailure { .. }));

    // an explicit connect starts over
    let live = start_echo_server().await;
    conn.connect_to(live.clone()).await.unwrap();
    assert_eq!(conn.recovery_state(), RecoveryState::Idle);
    assert_eq!(conn.call("echo", json!(2)).await.unwrap().result(), Some(&json!(2)));
}

#[tokio::test]
async fn test_close_unblocks_receive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = PeerAddress::from(listener.local_addr().unwrap());
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // stay silent until the client goes away
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(_)) = lines.next_line().await {}
    });

    let conn = Arc::new(Connection::new(PoolManager::new(), addr, fast_config(1)).unwrap());
    conn.connect().await.unwrap();

    let receiver = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.close().await;

    let received = tokio::time::timeout(Duration::from_secs(1), receiver).await.unwrap().unwrap();
    assert!(matches!(received, Err(PeerlinkError::Closed)));
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    // closing twice is harmless
    conn.close().await;
    peer.await.unwrap();
}

#[tokio::test]
async fn test_malformed_line_from_peer_is_answered_and_skipped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = PeerAddress::from(listener.local_addr().unwrap());
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"{broken\n").await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();

        let request = json!({"jsonrpc": "2.0", "method": "ping", "params": [], "id": "p1"});
        write.write_all(format!("{}\n", request).as_bytes()).await.unwrap();
        let answer: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        (reply, answer)
    });

    let conn = Connection::new(PoolManager::new(), addr, fast_config(1)).unwrap();
    let request = match conn.receive().await.unwrap() {
        Some(Message::Request(request)) => request,
        other => panic!("expected request, got {:?}", other),
    };
    assert_eq!(request.method, "ping");
    assert_eq!(request.id, RequestId::String("p1".into()));
    conn.respond(peerlink_common::JsonRpcResponse::success(request.id, json!("pong"))).await.unwrap();

    let (reply, answer) = peer.await.unwrap();
    assert_eq!(reply["error"]["code"], json!(-32600));
    assert_eq!(reply["id"], Value::Null);
    assert_eq!(answer, json!({"jsonrpc": "2.0", "result": "pong", "id": "p1"}));
}

#[tokio::test]
async fn test_peer_closing_link_ends_receive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = PeerAddress::from(listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    let conn = Connection::new(PoolManager::new(), addr, fast_config(1)).unwrap();
    assert!(conn.receive().await.unwrap().is_none());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_responses() {
    let addr = start_echo_server().await;
    let conn = Arc::new(Connection::new(PoolManager::new(), addr, fast_config(2)).unwrap());

    let calls = (0..16).map(|n| {
        let conn = conn.clone();
        async move { (n, conn.call("echo", json!(n)).await) }
    });

    for (n, response) in futures::future::join_all(calls).await {
        assert_eq!(response.unwrap().result(), Some(&json!(n)));
    }
    assert_eq!(conn.pending_requests(), 0);
    assert!(conn.take_lost_requests().is_empty());
}

#[tokio::test]
async fn test_authenticate_trusted_peer() {
    let signer = Arc::new(Blake2bEd25519Signer::from_seed([7u8; 32], PayloadDigest::unkeyed()));
    let addr = start_server(Dispatcher::new().with_method(HELLO_METHOD, hello_handler(signer.clone()))).await;
    let conn = Connection::new(PoolManager::new(), addr, fast_config(1)).unwrap();
    let verifier = Blake2bEd25519Verifier::default();

    let key = conn.authenticate(&verifier, Some(&[signer.public_key()])).await.unwrap();
    assert_eq!(key, signer.public_key());

    let err = conn.authenticate(&verifier, Some(&[[0u8; 32]])).await.unwrap_err();
    assert!(matches!(err, PeerlinkError::Signature(_)));
}

#[tokio::test]
async fn test_authenticate_rejects_peer_without_handshake() {
    let addr = start_echo_server().await;
    let conn = Connection::new(PoolManager::new(), addr, fast_config(1)).unwrap();

    let err = conn.authenticate(&Blake2bEd25519Verifier::default(), None).await.unwrap_err();
    assert!(matches!(err, PeerlinkError::Signature(_)));
}

#[tokio::test]
async fn test_release_returns_assignment() {
    let addr = start_echo_server().await;
    let manager = PoolManager::with_peers(vec![addr]);
    let conn = Connection::from_pool(manager.clone(), fast_config(1)).unwrap();
    conn.call("echo", json!(null)).await.unwrap();

    conn.release().await;
    assert_eq!(manager.client_count(), 0);
    assert!(!conn.is_connected());
}

/// Peer sends one line over the client's limit, then a `ping` request, and
/// returns the two lines the client writes back.
async fn oversized_line_exchange(split: bool) -> (Value, Value, peerlink_common::JsonRpcRequest) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = PeerAddress::from(listener.local_addr().unwrap());
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        stream.set_nodelay(true).unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let hidden = json!({"jsonrpc": "2.0", "method": "big", "params": "x".repeat(100), "id": 1});
        let big = format!("{}\n", hidden);
        if split {
            write.write_all(&big.as_bytes()[..80]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            write.write_all(&big.as_bytes()[80..]).await.unwrap();
        } else {
            write.write_all(big.as_bytes()).await.unwrap();
        }
        let ping = json!({"jsonrpc": "2.0", "method": "ping", "params": [], "id": 2});
        write.write_all(format!("{}\n", ping).as_bytes()).await.unwrap();

        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let answer: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        (reply, answer)
    });

    let conn = Connection::new(PoolManager::new(), addr, fast_config(1).with_max_line_size(64)).unwrap();
    let request = match conn.receive().await.unwrap() {
        Some(Message::Request(request)) => request,
        other => panic!("expected request, got {:?}", other),
    };
    conn.respond(peerlink_common::JsonRpcResponse::success(request.id.clone(), json!("pong")))
        .await
        .unwrap();

    let (reply, answer) = peer.await.unwrap();
    (reply, answer, request)
}

#[tokio::test]
async fn test_oversized_line_is_rejected_once() {
    for split in [false, true] {
        let (reply, answer, request) = oversized_line_exchange(split).await;

        // the oversized request is never handed out
        assert_eq!(request.method, "ping", "split: {}", split);
        assert_eq!(reply["error"]["code"], json!(-32600), "split: {}", split);
        assert_eq!(reply["id"], Value::Null);
        // one rejection only; the next line back is the answer to ping
        assert_eq!(answer["id"], json!(2), "split: {}", split);
        assert_eq!(answer["result"], json!("pong"));
    }
}

#[tokio::test]
#[allow(deprecated)]
async fn test_failed_write_is_sent_again_on_a_fresh_link() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = PeerAddress::from(listener.local_addr().unwrap());
    let peer = tokio::spawn(async move {
        // first link is reset as soon as it is accepted
        let (first, _) = listener.accept().await.unwrap();
        first.set_linger(Some(Duration::ZERO)).unwrap();
        drop(first);

        // second link answers one request
        let (second, _) = listener.accept().await.unwrap();
        let (read, mut write) = second.into_split();
        let mut lines = BufReader::new(read).lines();
        let request: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let reply = json!({"jsonrpc": "2.0", "result": request["params"], "id": request["id"]});
        write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
        let rest = lines.next_line().await.unwrap();
        (request, rest)
    });

    let conn = Connection::new(PoolManager::new(), addr.clone(), fast_config(2)).unwrap();
    conn.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = conn.call("echo", json!("again")).await.unwrap();
    assert_eq!(response.result(), Some(&json!("again")));
    assert_eq!(conn.target(), addr);
    assert!(conn.take_lost_requests().is_empty());
    conn.close().await;

    let (request, rest) = peer.await.unwrap();
    assert_eq!(request["method"], json!("echo"));
    // written exactly once on the fresh link
    assert!(rest.is_none());
}

#[tokio::test]
async fn test_read_timeout_fails_over_and_reports_lost_request() {
    // first peer takes one request, stops listening and goes silent
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = PeerAddress::from(silent.local_addr().unwrap());
    let silent_peer = tokio::spawn(async move {
        let (stream, _) = silent.accept().await.unwrap();
        drop(silent);
        let mut lines = BufReader::new(stream).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        line
    });

    // second peer pushes a request as soon as a client connects
    let backup = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backup_addr = PeerAddress::from(backup.local_addr().unwrap());
    tokio::spawn(async move {
        let (mut stream, _) = backup.accept().await.unwrap();
        let hello = json!({"jsonrpc": "2.0", "method": "hello", "params": {}, "id": "b1"});
        stream.write_all(format!("{}\n", hello).as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let manager = PoolManager::with_peers(vec![silent_addr.clone(), backup_addr.clone()]);
    let config = fast_config(2).with_timeout(Duration::from_millis(300));
    let conn = Connection::from_pool(manager.clone(), config).unwrap();
    assert_eq!(conn.target(), silent_addr);

    let raw = peerlink_common::JsonRpcRequest::new(5, "slow", json!([]));
    conn.send(&Message::from(raw)).await.unwrap();
    assert_eq!(conn.pending_requests(), 1);

    // the read times out, the link is rebuilt on the backup and read again
    match conn.receive().await.unwrap() {
        Some(Message::Request(request)) => assert_eq!(request.id, RequestId::String("b1".into())),
        other => panic!("expected request from backup, got {:?}", other),
    }
    assert_eq!(conn.target(), backup_addr);
    assert_eq!(manager.assignment_of(conn.id()), Some(backup_addr));
    assert_eq!(conn.pending_requests(), 0);
    assert_eq!(conn.take_lost_requests(), vec![RequestId::Number(5)]);
    assert!(conn.take_lost_requests().is_empty());

    silent_peer.abort();
}

#[tokio::test]
async fn test_call_in_flight_when_link_drops_is_lost() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = PeerAddress::from(listener.local_addr().unwrap());
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        line
    });

    let config = fast_config(1).with_timeout(Duration::from_millis(300));
    let conn = Connection::new(PoolManager::new(), addr, config).unwrap();

    match conn.call("echo", json!("never answered")).await {
        Err(PeerlinkError::RequestLost(id)) => assert_eq!(id, RequestId::Number(1)),
        other => panic!("expected RequestLost, got {:?}", other),
    }
    assert_eq!(conn.pending_requests(), 0);
    // call reports the loss itself; nothing is left for take_lost_requests
    assert!(conn.take_lost_requests().is_empty());
    assert!(!conn.is_connected());

    peer.abort();
}

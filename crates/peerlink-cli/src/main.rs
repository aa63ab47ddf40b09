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

//! # Peerlink CLI
//!
//! Runs a line-delimited JSON-RPC peer, or calls one through a failover pool.
//!
//! ## Usage
//!
//! ```bash
//! # Start an echo peer
//! peerlink serve -b 127.0.0.1:9001
//!
//! # Start a peer that answers the signed handshake
//! peerlink serve -b 127.0.0.1:9002 --signing-seed $(peerlink keygen | head -1)
//!
//! # Call through a pool; the second peer takes over if the first is down
//! peerlink call -p 127.0.0.1:9001 -p 127.0.0.1:9002 echo -a '"hi"'
//!
//! # Only talk to a peer holding a known key
//! peerlink call -p 127.0.0.1:9002 --trust <public key hex> echo -a '[1, 2]'
//! ```

use anyhow::Result;
use argh::FromArgs;
use peerlink_client::{Connection, ConnectionConfig};
use peerlink_common::protocol::Dispatcher;
use peerlink_common::signer::{hello_handler, Blake2bEd25519Signer, Blake2bEd25519Verifier, PayloadDigest, HELLO_METHOD};
use peerlink_common::transport::PeerServer;
use peerlink_common::PeerAddress;
use peerlink_manager::PoolManager;
use std::sync::Arc;
use std::time::Duration;

#[derive(FromArgs)]
/// Peerlink - JSON-RPC over TCP with peer failover
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Keygen(KeygenArgs),
}

/// Arguments for running a peer.
///
/// The peer answers `echo` with its params. With a signing seed it also
/// answers the `peer.hello` handshake.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run a peer that answers echo requests
struct ServeArgs {
    /// address to listen on
    ///
    /// Defaults to "127.0.0.1:0", which picks a free port. The bound address
    /// is logged at startup.
    #[argh(option, short = 'b', default = "\"127.0.0.1:0\".into()")]
    bind: String,

    /// hex-encoded 32-byte Ed25519 seed used to sign handshakes
    #[argh(option, long = "signing-seed")]
    signing_seed: Option<String>,

    /// hex-encoded BLAKE2b key applied before signing
    #[argh(option, long = "digest-key")]
    digest_key: Option<String>,
}

/// Arguments for making a single call.
///
/// Outputs the raw JSON result on stdout; errors go to stderr with a
/// non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method through a pool of peers
struct CallArgs {
    /// peer to add to the pool, as host:port (repeatable, tried in order)
    #[argh(option, short = 'p', long = "peer")]
    peers: Vec<String>,

    /// name of the method to call
    #[argh(positional)]
    method: String,

    /// JSON params for the method
    ///
    /// Defaults to `{}`.
    #[argh(option, short = 'a', long = "args", default = "\"{}\".into()")]
    args: String,

    /// per-operation timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "10000")]
    timeout_ms: u64,

    /// connection attempts per peer before moving to the next one
    #[argh(option, long = "max-retries", default = "5")]
    max_retries: u32,

    /// hex public key the peer must prove it holds (repeatable)
    #[argh(option, long = "trust")]
    trusted: Vec<String>,

    /// hex-encoded BLAKE2b key the peer signs with
    #[argh(option, long = "digest-key")]
    digest_key: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "keygen")]
/// print a fresh signing seed and its public key
struct KeygenArgs {}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call and keygen print to stdout only; keep it clean for piping
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Keygen(_) => run_keygen(),
    }
}

fn payload_digest(key: Option<&str>) -> Result<PayloadDigest> {
    match key {
        Some(key) => {
            let bytes = hex::decode(key).map_err(|e| anyhow::anyhow!("Invalid digest key: {}", e))?;
            Ok(PayloadDigest::keyed(&bytes)?)
        }
        None => Ok(PayloadDigest::unkeyed()),
    }
}

fn parse_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key).map_err(|e| anyhow::anyhow!("Invalid public key {}: {}", hex_key, e))?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Invalid public key {}: expected 32 bytes", hex_key))
}

fn build_dispatcher(args: &ServeArgs) -> Result<Dispatcher> {
    let mut dispatcher = Dispatcher::new().with_method("echo", Ok);

    if let Some(seed) = &args.signing_seed {
        let digest = payload_digest(args.digest_key.as_deref())?;
        let signer = Blake2bEd25519Signer::from_seed_hex(seed, digest)?;
        tracing::info!("Handshake enabled, public key {}", signer.public_key_hex());
        dispatcher.register(HELLO_METHOD, hello_handler(Arc::new(signer)));
    }
    Ok(dispatcher)
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let dispatcher = build_dispatcher(&args)?;
    tracing::info!("Methods: {:?}", dispatcher.methods());

    let server = PeerServer::bind(&args.bind).await?;
    tracing::info!("Peer listening on {}", server.local_addr()?);
    server.run(Arc::new(dispatcher)).await?;
    Ok(())
}

/// Executes the `call` subcommand.
///
/// Builds a pool from `--peer`, takes the first peer that accepts a
/// connection, optionally checks its key, and prints the result.
async fn run_call(args: CallArgs) -> Result<()> {
    if args.peers.is_empty() {
        anyhow::bail!("No peers given; use -p host:port");
    }
    let peers = args
        .peers
        .iter()
        .map(|peer| peer.parse::<PeerAddress>())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let params: serde_json::Value =
        serde_json::from_str(&args.args).map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))?;
    let trusted = args.trusted.iter().map(|key| parse_key(key)).collect::<Result<Vec<_>>>()?;

    let config = ConnectionConfig::default()
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_max_retries(args.max_retries);
    let conn = Connection::from_pool(PoolManager::with_peers(peers), config)?;

    if !trusted.is_empty() {
        let verifier = Blake2bEd25519Verifier::new(payload_digest(args.digest_key.as_deref())?);
        conn.authenticate(&verifier, Some(&trusted)).await?;
    }

    let response = conn.call(&args.method, params).await;
    conn.release().await;

    match response?.into_result() {
        Ok(result) => {
            println!("{}", serde_json::to_string(&result)?);
            Ok(())
        }
        Err(err) => Err(anyhow::anyhow!("Peer returned error {}", err)),
    }
}

fn run_keygen() -> Result<()> {
    let seed: [u8; 32] = rand::random();
    let signer = Blake2bEd25519Signer::from_seed(seed, PayloadDigest::unkeyed());
    println!("{}", hex::encode(seed));
    println!("{}", signer.public_key_hex());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve_defaults() {
        let cli = Cli::from_args(&["peerlink"], &["serve"]).unwrap();
        match cli.command {
            Commands::Serve(ServeArgs { bind, signing_seed, digest_key }) => {
                assert_eq!(bind, "127.0.0.1:0");
                assert!(signing_seed.is_none());
                assert!(digest_key.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_call() {
        let cli = Cli::from_args(
            &["peerlink"],
            &["call", "-p", "127.0.0.1:9001", "--peer", "127.0.0.1:9002", "echo", "-a", "[1]"],
        )
        .unwrap();
        match cli.command {
            Commands::Call(args) => {
                assert_eq!(args.peers, vec!["127.0.0.1:9001", "127.0.0.1:9002"]);
                assert_eq!(args.method, "echo");
                assert_eq!(args.args, "[1]");
                assert_eq!(args.timeout_ms, 10000);
                assert_eq!(args.max_retries, 5);
                assert!(args.trusted.is_empty());
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_default_args() {
        let cli = Cli::from_args(&["peerlink"], &["call", "-p", "h:1", "status"]).unwrap();
        match cli.command {
            Commands::Call(CallArgs { args, .. }) => assert_eq!(args, "{}"),
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_dispatcher_gets_handshake_only_with_seed() {
        let plain = ServeArgs {
            bind: "127.0.0.1:0".into(),
            signing_seed: None,
            digest_key: None,
        };
        assert_eq!(build_dispatcher(&plain).unwrap().methods(), vec!["echo"]);

        let signed = ServeArgs {
            signing_seed: Some(hex::encode([1u8; 32])),
            ..plain
        };
        assert!(build_dispatcher(&signed).unwrap().has_method(HELLO_METHOD));

        let bad = ServeArgs {
            bind: "127.0.0.1:0".into(),
            signing_seed: Some("zz".into()),
            digest_key: None,
        };
        assert!(build_dispatcher(&bad).is_err());
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key(&hex::encode([3u8; 32])).unwrap(), [3u8; 32]);
        assert!(parse_key("abcd").is_err());
        assert!(parse_key("not hex").is_err());
    }
}

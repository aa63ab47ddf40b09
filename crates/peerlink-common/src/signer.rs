//! Peer Identity Signing
//!
//! Optional authentication of a peer's identity. A peer holding an Ed25519
//! key answers the `peer.hello` method by signing a caller-chosen nonce; the
//! caller checks the signature and, if it keeps a trust list, the key.
//!
//! # Construction
//!
//! Signatures are Ed25519 over the 64-byte BLAKE2b digest of the payload.
//! The digest may be keyed with a shared secret of up to 64 bytes, in which
//! case both sides must be configured with the same key.
//!
//! # Example
//!
//! ```
//! use peerlink_common::signer::{Blake2bEd25519Signer, Blake2bEd25519Verifier, PayloadDigest, Signer, Verifier};
//!
//! let signer = Blake2bEd25519Signer::from_seed([7u8; 32], PayloadDigest::unkeyed());
//! let verifier = Blake2bEd25519Verifier::new(PayloadDigest::unkeyed());
//!
//! let signature = signer.sign(b"nonce");
//! assert!(verifier.verify(&signer.public_key(), b"nonce", &signature));
//! assert!(!verifier.verify(&signer.public_key(), b"other", &signature));
//! ```

use std::fmt;
use std::sync::Arc;

use blake2::digest::{KeyInit, Mac};
use blake2::{Blake2b512, Blake2bMac512, Digest};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use serde_json::{json, Value};

use crate::protocol::dispatch::HandlerResult;
use crate::protocol::error::{PeerlinkError, Result};
use crate::protocol::JsonRpcError;

/// Method name of the identity handshake.
pub const HELLO_METHOD: &str = "peer.hello";

/// Length of the nonce a client sends with `peer.hello`.
pub const NONCE_LEN: usize = 32;

const MAX_DIGEST_KEY_LEN: usize = 64;

/// Something that can sign on behalf of a peer.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> [u8; 32];

    fn sign(&self, data: &[u8]) -> [u8; 64];
}

/// Checks signatures produced by a [`Signer`].
pub trait Verifier: Send + Sync {
    fn verify(&self, public_key: &[u8; 32], data: &[u8], signature: &[u8; 64]) -> bool;
}

/// BLAKE2b-512 digest applied to payloads before signing.
#[derive(Clone, Default)]
pub struct PayloadDigest {
    mac: Option<Blake2bMac512>,
}

impl PayloadDigest {
    pub fn unkeyed() -> Self {
        Self { mac: None }
    }

    /// Keyed digest. Keys must be 1 to 64 bytes.
    pub fn keyed(key: &[u8]) -> Result<Self> {
        if key.is_empty() || key.len() > MAX_DIGEST_KEY_LEN {
            return Err(PeerlinkError::InvalidConfig(format!(
                "digest key must be 1-{} bytes, got {}",
                MAX_DIGEST_KEY_LEN,
                key.len()
            )));
        }
        let mac = <Blake2bMac512 as KeyInit>::new_from_slice(key)
            .map_err(|e| PeerlinkError::InvalidConfig(format!("digest key rejected: {}", e)))?;
        Ok(Self { mac: Some(mac) })
    }

    pub fn is_keyed(&self) -> bool {
        self.mac.is_some()
    }

    pub fn digest(&self, data: &[u8]) -> [u8; 64] {
        let mut out = [0u8; 64];
        match &self.mac {
            None => out.copy_from_slice(&Blake2b512::digest(data)),
            Some(mac) => {
                let mut mac = mac.clone();
                Mac::update(&mut mac, data);
                out.copy_from_slice(&Mac::finalize(mac).into_bytes());
            }
        }
        out
    }
}

impl fmt::Debug for PayloadDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadDigest")
            .field("keyed", &self.is_keyed())
            .finish()
    }
}

/// Ed25519 signer over BLAKE2b digests.
#[derive(Clone)]
pub struct Blake2bEd25519Signer {
    signing_key: SigningKey,
    digest: PayloadDigest,
}

impl Blake2bEd25519Signer {
    pub fn from_seed(seed: [u8; 32], digest: PayloadDigest) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
            digest,
        }
    }

    /// Create a signer from a hex-encoded 32-byte seed.
    pub fn from_seed_hex(seed_hex: &str, digest: PayloadDigest) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| PeerlinkError::InvalidConfig(format!("signing seed is not hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PeerlinkError::InvalidConfig("signing seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(seed, digest))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }
}

impl Signer for Blake2bEd25519Signer {
    fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    fn sign(&self, data: &[u8]) -> [u8; 64] {
        use ed25519_dalek::Signer as _;
        let digest = self.digest.digest(data);
        self.signing_key.sign(&digest).to_bytes()
    }
}

impl fmt::Debug for Blake2bEd25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blake2bEd25519Signer")
            .field("public_key", &self.public_key_hex())
            .field("digest", &self.digest)
            .finish()
    }
}

/// Verifier matching [`Blake2bEd25519Signer`].
#[derive(Debug, Clone, Default)]
pub struct Blake2bEd25519Verifier {
    digest: PayloadDigest,
}

impl Blake2bEd25519Verifier {
    pub fn new(digest: PayloadDigest) -> Self {
        Self { digest }
    }
}

impl Verifier for Blake2bEd25519Verifier {
    fn verify(&self, public_key: &[u8; 32], data: &[u8], signature: &[u8; 64]) -> bool {
        use ed25519_dalek::Verifier as _;
        let Ok(key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let signature = Signature::from_bytes(signature);
        key.verify(&self.digest.digest(data), &signature).is_ok()
    }
}

/// Builds the `peer.hello` handler for a [`Dispatcher`](crate::protocol::Dispatcher).
pub fn hello_handler(signer: Arc<dyn Signer>) -> impl Fn(Value) -> HandlerResult + Send + Sync + 'static {
    move |params: Value| {
        let nonce = params
            .get("nonce")
            .and_then(Value::as_str)
            .ok_or_else(|| JsonRpcError::invalid_params("expected {\"nonce\": <hex>}"))?;
        let nonce = hex::decode(nonce).map_err(|_| JsonRpcError::invalid_params("nonce must be hex"))?;
        if nonce.is_empty() {
            return Err(JsonRpcError::invalid_params("nonce must not be empty"));
        }

        Ok(json!({
            "public_key": hex::encode(signer.public_key()),
            "signature": hex::encode(signer.sign(&nonce)),
        }))
    }
}

/// Params for a `peer.hello` request carrying `nonce`.
pub fn hello_params(nonce: &[u8]) -> Value {
    json!({ "nonce": hex::encode(nonce) })
}

/// Checks a `peer.hello` result and returns the peer's public key.
pub fn verify_hello(verifier: &dyn Verifier, nonce: &[u8], result: &Value) -> Result<[u8; 32]> {
    let public_key: [u8; 32] = decode_field(result, "public_key")?;
    let signature: [u8; 64] = decode_field(result, "signature")?;

    if !verifier.verify(&public_key, nonce, &signature) {
        return Err(PeerlinkError::Signature(format!(
            "signature by {} does not cover the nonce",
            hex::encode(public_key)
        )));
    }
    Ok(public_key)
}

fn decode_field<const N: usize>(result: &Value, field: &str) -> Result<[u8; N]> {
    let text = result
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| PeerlinkError::Signature(format!("hello result has no '{}'", field)))?;
    let bytes = hex::decode(text).map_err(|e| PeerlinkError::Signature(format!("'{}' is not hex: {}", field, e)))?;
    bytes
        .try_into()
        .map_err(|_| PeerlinkError::Signature(format!("'{}' must be {} bytes", field, N)))
}

//! Diffie-Hellman key agreement for one-to-one calls.
//!
//! The engine only orchestrates the exchange. The arithmetic lives behind
//! [`CallCrypto`] so hosts can plug in their own implementation;
//! [`X25519CallCrypto`] is the default.

use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use super::error::CallError;
use crate::crypto::hkdf;
use crate::types::call::DhConfig;

/// Length in bytes of the shared key both sides derive.
pub const CALL_KEY_LEN: usize = 256;

const KEY_INFO: &[u8] = b"callcore p2p call key";

/// One side's freshly generated DH material.
#[derive(Clone)]
pub struct DhShare {
    pub secret: Vec<u8>,
    pub public: Vec<u8>,
    pub public_hash: Vec<u8>,
}

impl std::fmt::Debug for DhShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhShare")
            .field("public", &hex::encode(&self.public))
            .finish_non_exhaustive()
    }
}

/// Shared key and the fingerprint both sides compare.
#[derive(Clone)]
pub struct ComputedKey {
    pub key: Vec<u8>,
    pub fingerprint: i64,
}

impl std::fmt::Debug for ComputedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedKey")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Transient DH state of a call.
///
/// The initiator fills `a`, `g_a` and `g_a_hash`; the acceptor fills `b`,
/// `g_b` and `g_b_hash` and keeps the initiator's `g_a_hash` to verify `g_a`
/// later. Secrets are dropped once the key is derived.
#[derive(Default, Clone)]
pub struct DiffieHellmanInfo {
    pub p: Vec<u8>,
    pub a: Option<Vec<u8>>,
    pub g_a: Option<Vec<u8>>,
    pub g_a_hash: Option<Vec<u8>>,
    pub b: Option<Vec<u8>>,
    pub g_b: Option<Vec<u8>>,
    pub g_b_hash: Option<Vec<u8>>,
}

impl DiffieHellmanInfo {
    pub fn initiator(p: Vec<u8>, share: DhShare) -> Self {
        Self {
            p,
            a: Some(share.secret),
            g_a: Some(share.public),
            g_a_hash: Some(share.public_hash),
            ..Default::default()
        }
    }

    pub fn acceptor(p: Vec<u8>, share: DhShare, g_a_hash: Vec<u8>) -> Self {
        Self {
            p,
            b: Some(share.secret),
            g_b: Some(share.public),
            g_b_hash: Some(share.public_hash),
            g_a_hash: Some(g_a_hash),
            ..Default::default()
        }
    }

    /// Forgets the private exponents.
    pub fn clear_secrets(&mut self) {
        self.a = None;
        self.b = None;
    }
}

#[async_trait]
pub trait CallCrypto: Send + Sync {
    /// Generates this side's share for the given server parameters.
    async fn generate_dh(&self, config: &DhConfig) -> Result<DhShare, CallError>;

    /// Combines the peer's public share with our secret.
    async fn compute_key(
        &self,
        peer_public: &[u8],
        secret: &[u8],
        p: &[u8],
    ) -> Result<ComputedKey, CallError>;

    fn sha256(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }
}

/// Curve25519 implementation of [`CallCrypto`].
#[derive(Debug, Default, Clone, Copy)]
pub struct X25519CallCrypto;

fn to_array(bytes: &[u8], what: &'static str) -> Result<[u8; 32], CallError> {
    bytes
        .try_into()
        .map_err(|_| CallError::MissingAttribute(what))
}

#[async_trait]
impl CallCrypto for X25519CallCrypto {
    async fn generate_dh(&self, config: &DhConfig) -> Result<DhShare, CallError> {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        for (byte, salt) in secret.iter_mut().zip(config.random.iter()) {
            *byte ^= salt;
        }

        let private = StaticSecret::from(secret);
        let public = PublicKey::from(&private).to_bytes().to_vec();
        let public_hash = self.sha256(&public);
        Ok(DhShare {
            secret: private.to_bytes().to_vec(),
            public,
            public_hash,
        })
    }

    async fn compute_key(
        &self,
        peer_public: &[u8],
        secret: &[u8],
        p: &[u8],
    ) -> Result<ComputedKey, CallError> {
        let private = StaticSecret::from(to_array(secret, "dh secret")?);
        let public = PublicKey::from(to_array(peer_public, "dh public share")?);
        let shared = private.diffie_hellman(&public);
        if !shared.was_contributory() {
            return Err(CallError::CryptoMismatch("non-contributory dh share"));
        }

        let key = hkdf::sha256(shared.as_bytes(), Some(p), KEY_INFO, CALL_KEY_LEN)?;
        let fingerprint = key_fingerprint(&key);
        Ok(ComputedKey { key, fingerprint })
    }
}

/// Low 64 bits of `sha256(key)`, little endian.
pub fn key_fingerprint(key: &[u8]) -> i64 {
    let digest = Sha256::digest(key);
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&digest[24..32]);
    i64::from_le_bytes(tail)
}

const EMOJIS: [&str; 64] = [
    "😉", "😍", "😛", "😭", "😱", "😡", "😎", "😴", "😵", "😈", "😬", "😇", "😏", "👮", "👷", "💂",
    "👶", "👨", "👩", "👴", "👵", "😻", "😽", "🙀", "👺", "🙈", "🙉", "🙊", "💀", "👽", "💩", "🔥",
    "💥", "💤", "👂", "👀", "👃", "👅", "👄", "👍", "👎", "👌", "👊", "✌", "✋", "👐", "👆", "👇",
    "👉", "👈", "🙏", "👏", "💪", "🚶", "🏃", "💃", "👫", "👪", "👬", "👭", "💅", "🎩", "👑", "👒",
];

/// Four emoji both parties can compare out of band to detect a MITM.
pub fn emoji_fingerprint(key: &[u8], g_a: &[u8]) -> [&'static str; 4] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(g_a);
    let digest = hasher.finalize();

    let mut out = [""; 4];
    for (slot, chunk) in out.iter_mut().zip(digest.chunks_exact(8)) {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let value = u64::from_be_bytes(word) & 0x7fff_ffff_ffff_ffff;
        *slot = EMOJIS[(value % EMOJIS.len() as u64) as usize];
    }
    out
}

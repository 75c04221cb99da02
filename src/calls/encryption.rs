//! Authenticated encryption of signaling payloads.
//!
//! Each call holds two independent encryptors built from the same DH key:
//! one sealing what we send, one opening what the peer sends. The direction
//! is baked into the derived AES key so the two never share a nonce space.
//!
//! # Packet layout
//!
//! ```text
//! +-------------------+--------------------------+
//! | counter (8, BE)   | ciphertext || tag (16)   |
//! +-------------------+--------------------------+
//! ```
//!
//! The counter doubles as the nonce suffix and the AAD, and must strictly
//! increase on the receiving side.

use aes_gcm::Aes256Gcm;
use log::warn;

use super::error::CallError;
use crate::crypto::{gcm, hkdf};

const COUNTER_LEN: usize = 8;

/// Raw packet produced by [`P2PEncryptor::encrypt_raw_packet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPacket {
    pub bytes: Vec<u8>,
}

/// One direction of the signaling channel.
pub struct P2PEncryptor {
    cipher: Aes256Gcm,
    is_outgoing: bool,
    send_counter: u64,
    last_received: Option<u64>,
}

impl std::fmt::Debug for P2PEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2PEncryptor")
            .field("is_outgoing", &self.is_outgoing)
            .field("send_counter", &self.send_counter)
            .field("last_received", &self.last_received)
            .finish()
    }
}

impl P2PEncryptor {
    /// Builds the encryptor for packets sealed by the initiator
    /// (`is_outgoing == true`) or by the acceptor.
    pub fn new(is_outgoing: bool, key: &[u8]) -> Result<Self, CallError> {
        let info: &[u8] = if is_outgoing {
            b"callcore signaling initiator"
        } else {
            b"callcore signaling acceptor"
        };
        let aes_key = hkdf::sha256_array::<32>(key, None, info)?;
        Ok(Self {
            cipher: gcm::prepare(&aes_key)?,
            is_outgoing,
            send_counter: 0,
            last_received: None,
        })
    }

    pub fn is_outgoing(&self) -> bool {
        self.is_outgoing
    }

    pub fn encrypt_raw_packet(&mut self, data: &[u8]) -> Result<EncryptedPacket, CallError> {
        self.send_counter += 1;
        let counter = self.send_counter.to_be_bytes();
        let nonce = gcm::counter_nonce(self.send_counter);
        let sealed = gcm::seal(&self.cipher, &nonce, data, &counter)?;

        let mut bytes = Vec::with_capacity(COUNTER_LEN + sealed.len());
        bytes.extend_from_slice(&counter);
        bytes.extend_from_slice(&sealed);
        Ok(EncryptedPacket { bytes })
    }

    /// Opens a packet, or returns `None` if it is truncated, forged or replayed.
    pub fn decrypt_raw_packet(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < COUNTER_LEN + gcm::TAG_LEN {
            warn!("Dropping signaling packet: {} bytes is too short", data.len());
            return None;
        }
        let (counter_bytes, sealed) = data.split_at(COUNTER_LEN);
        let mut raw = [0u8; COUNTER_LEN];
        raw.copy_from_slice(counter_bytes);
        let counter = u64::from_be_bytes(raw);

        if self.last_received.is_some_and(|last| counter <= last) {
            warn!("Dropping replayed signaling packet #{}", counter);
            return None;
        }

        let nonce = gcm::counter_nonce(counter);
        match gcm::open(&self.cipher, &nonce, sealed, counter_bytes) {
            Ok(plain) => {
                self.last_received = Some(counter);
                Some(plain)
            }
            Err(e) => {
                warn!("Dropping signaling packet #{}: {}", counter, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (P2PEncryptor, P2PEncryptor) {
        let key = [0x42u8; 256];
        (
            P2PEncryptor::new(true, &key).unwrap(),
            P2PEncryptor::new(true, &key).unwrap(),
        )
    }

    #[test]
    fn test_peer_decrypts_in_matching_direction() {
        let (mut sender, mut receiver) = pair();
        let packet = sender.encrypt_raw_packet(b"{\"@type\":\"Candidates\"}").unwrap();
        assert_eq!(
            receiver.decrypt_raw_packet(&packet.bytes).unwrap(),
            b"{\"@type\":\"Candidates\"}"
        );
    }

    /// The two directions use distinct keys.
    #[test]
    fn test_directions_are_independent() {
        let key = [0x42u8; 256];
        let mut initiator = P2PEncryptor::new(true, &key).unwrap();
        let mut acceptor = P2PEncryptor::new(false, &key).unwrap();
        let packet = initiator.encrypt_raw_packet(b"hello").unwrap();
        assert!(acceptor.decrypt_raw_packet(&packet.bytes).is_none());
    }

    #[test]
    fn test_tampered_packet_returns_none() {
        let (mut sender, mut receiver) = pair();
        let mut packet = sender.encrypt_raw_packet(b"hello").unwrap();
        let last = packet.bytes.len() - 1;
        packet.bytes[last] ^= 0x01;
        assert!(receiver.decrypt_raw_packet(&packet.bytes).is_none());

        // A corrupt frame does not poison the stream.
        let next = sender.encrypt_raw_packet(b"world").unwrap();
        assert_eq!(receiver.decrypt_raw_packet(&next.bytes).unwrap(), b"world");
    }

    #[test]
    fn test_replay_rejected() {
        let (mut sender, mut receiver) = pair();
        let packet = sender.encrypt_raw_packet(b"once").unwrap();
        assert!(receiver.decrypt_raw_packet(&packet.bytes).is_some());
        assert!(receiver.decrypt_raw_packet(&packet.bytes).is_none());
    }

    #[test]
    fn test_truncated_packet() {
        let (_, mut receiver) = pair();
        assert!(receiver.decrypt_raw_packet(&[0u8; 10]).is_none());
    }
}

//! # Cryptography Utilities
//!
//! Thin wrappers over the AEAD and key-derivation primitives used by the call
//! engine: AES-256-GCM for signaling payloads and HKDF-SHA256 for per-direction
//! keys and DH key expansion.

pub mod gcm;
pub mod hkdf;

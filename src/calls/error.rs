//! Call-related error types.

use crate::crypto::gcm::GcmError;
use crate::crypto::hkdf::HkdfError;
use crate::types::call::{CallId, DiscardReason};
use thiserror::Error;

use super::sdp::SdpError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(CallId),

    #[error("invalid call state: {0}")]
    InvalidState(String),

    #[error("missing required attribute: {0}")]
    MissingAttribute(&'static str),

    #[error("malformed signaling data: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("sdp error: {0}")]
    Sdp(#[from] SdpError),

    #[error("incompatible peer: {0}")]
    Incompatible(String),

    #[error("crypto mismatch: {0}")]
    CryptoMismatch(&'static str),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("not connected")]
    NotConnected,
}

impl From<GcmError> for CallError {
    fn from(err: GcmError) -> Self {
        Self::Encryption(err.to_string())
    }
}

impl From<HkdfError> for CallError {
    fn from(err: HkdfError) -> Self {
        Self::Encryption(err.to_string())
    }
}

impl CallError {
    /// Reason reported when this error terminates a call.
    pub fn hang_up_reason(&self) -> DiscardReason {
        match self {
            Self::Protocol(_)
            | Self::Sdp(_)
            | Self::Incompatible(_)
            | Self::CryptoMismatch(_)
            | Self::Encryption(_) => DiscardReason::Disconnect,
            _ => DiscardReason::Hangup,
        }
    }

    /// Errors that mean the peer speaks something we cannot follow.
    pub fn is_incompatibility(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Sdp(_) | Self::Incompatible(_))
    }
}

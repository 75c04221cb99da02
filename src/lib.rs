//! Signaling engine for end-to-end encrypted peer-to-peer voice and video calls.
//!
//! The crate drives the call lifecycle, the Diffie-Hellman key exchange and
//! the compact SDP exchange of a P2P call. Media capture, the WebRTC stack
//! and the messaging transport are supplied by the host through the traits
//! in [`calls`].

pub mod calls;
pub mod config;
pub mod crypto;

pub mod types {
    pub mod call;
    pub mod events;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use calls::{CallError, CallInstance, CallState, CallsController};
pub use config::CallConfig;

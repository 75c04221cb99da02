//! Peer-to-peer call signaling engine.
//!
//! Two parties negotiate a WebRTC session without exchanging raw SDP. A
//! Diffie-Hellman handshake over the messaging transport yields a shared key;
//! each side then sends compact, encrypted [`InitialSetup`] and
//! [`Candidates`] messages, and the receiver rebuilds a full remote
//! description from them locally.
//!
//! # Architecture
//!
//! - [`CallsController`]: registry of calls, routes [`CallUpdate`](crate::types::call::CallUpdate)s
//! - [`CallInstance`]: lifecycle, key exchange and signaling of one call
//! - [`ConnectionInstance`]: one peer connection and its offer/answer flags
//! - [`ConferenceDescription`]: negotiated m-lines and remote SDP synthesis
//! - [`P2PEncryptor`]: AES-GCM framing of signaling blobs with replay protection
//! - [`sdp`]: SDP parsing, building and ICE candidate handling
//! - [`media`]: peer connection, device and local stream seams
//!
//! # Call flow
//!
//! The caller requests the call with a hash of its share (`g_a_hash`), the
//! callee answers with `g_b`, the caller reveals `g_a` on confirmation and
//! both derive the key. From then on the caller offers, the callee answers
//! twice (once mirroring, once with its own media) and ICE connects.

mod connection;
mod controller;
mod description;
mod dh;
mod encryption;
mod error;
mod events;
mod instance;
pub mod media;
pub mod sdp;
mod signaling;
mod sound;
mod state;
mod transport;

pub use connection::ConnectionInstance;
pub use controller::CallsController;
pub use description::{
    CodecInfo, ConferenceDescription, ConferenceEntry, EntrySource, GenerateSdpOptions, MediaKind,
    RemoteTransport, SourceGroup, SourceLeg,
};
pub use dh::{
    CALL_KEY_LEN, CallCrypto, ComputedKey, DhShare, DiffieHellmanInfo, X25519CallCrypto,
    emoji_fingerprint, key_fingerprint,
};
pub use encryption::{EncryptedPacket, P2PEncryptor};
pub use error::CallError;
pub use events::{CallEvent, EventListeners, Listener};
pub use instance::{AcceptCallOverride, CallInstance, CallServices, filter_video_to_vp8};
pub use signaling::{
    CallSignalingData, Candidates, DtlsFingerprint, FeedbackType, InitialSetup, MediaContent,
    PayloadType, RtpExtension, SsrcGroup, WireCandidate,
};
pub use sound::{CallSound, CallSoundPlayer, LogSoundPlayer};
pub use state::{CallState, IceConnectionState, derive_state, sort_index};
pub use transport::CallTransport;

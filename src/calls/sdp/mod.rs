//! SDP codec.
//!
//! - [`SessionDescription`]: structural parser for native SDP text
//! - [`SdpBuilder`]: line builder used to synthesize remote descriptions
//! - [`CandidateInfo`]: ICE candidate line parser / formatter
//! - [`InitialSetup::from_sdp`](crate::calls::InitialSetup): local SDP to wire setup

mod builder;
mod candidate;
mod parse;
mod setup;

pub use builder::{MEDIA_PORT, SCTP_PORT, SdpBuilder, media_line_type};
pub use candidate::{CandidateInfo, CandidateType, IceCandidate};
pub use parse::{Direction, MediaSection, SdpAttribute, SessionDescription};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SdpError {
    #[error("malformed sdp line {line}: {reason}")]
    MalformedLine { line: usize, reason: &'static str },

    #[error("sdp has no media sections")]
    NoMedia,

    #[error("missing {0} in sdp")]
    Missing(&'static str),

    #[error("malformed candidate: {0}")]
    MalformedCandidate(String),
}

//! Messaging-protocol RPCs the engine relies on.

use async_trait::async_trait;

use super::error::CallError;
use crate::types::call::{CallPeer, CallProtocol, DhConfig, DiscardReason, PhoneCall, UserId};

/// Outbound half of the messaging transport.
///
/// Inbound updates are fed to [`CallsController::handle_update`](super::CallsController::handle_update).
#[async_trait]
pub trait CallTransport: Send + Sync {
    async fn get_dh_config(&self) -> Result<DhConfig, CallError>;

    /// Starts a call. The returned call carries the server-assigned id.
    async fn request_call(
        &self,
        user_id: UserId,
        g_a_hash: &[u8],
        protocol: &CallProtocol,
        video: bool,
    ) -> Result<PhoneCall, CallError>;

    async fn accept_call(
        &self,
        peer: CallPeer,
        g_b: &[u8],
        protocol: &CallProtocol,
    ) -> Result<PhoneCall, CallError>;

    async fn confirm_call(
        &self,
        peer: CallPeer,
        g_a: &[u8],
        key_fingerprint: i64,
        protocol: &CallProtocol,
    ) -> Result<PhoneCall, CallError>;

    async fn discard_call(
        &self,
        peer: CallPeer,
        duration_secs: u32,
        reason: DiscardReason,
        video: bool,
    ) -> Result<(), CallError>;

    /// Sends one encrypted signaling blob.
    async fn send_signaling_data(&self, peer: CallPeer, data: Vec<u8>) -> Result<(), CallError>;
}

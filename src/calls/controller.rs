//! Registry of live calls and router for inbound updates.

use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use super::error::CallError;
use super::events::CallEvent;
use super::instance::{CallInstance, CallServices};
use super::sound::CallSound;
use super::state::CallState;
use crate::config::CallConfig;
use crate::types::call::{CallId, CallProtocol, CallUpdate, DiscardReason, PhoneCall, UserId};
use crate::types::events::{CallInstanceCreated, CallStateChanged, EventBus, PeerIncompatible};

/// Owns every call instance, keyed by id, and routes transport updates to
/// them.
///
/// Calls are also kept in a list sorted by [`CallInstance::sort_index`]. The
/// first entry is the primary call, the only one allowed to drive
/// notification sounds.
pub struct CallsController {
    weak_self: Weak<CallsController>,
    config: Arc<CallConfig>,
    services: CallServices,
    instances: DashMap<CallId, Arc<CallInstance>>,
    sorted: Mutex<Vec<Arc<CallInstance>>>,
    next_temporary_id: AtomicI64,
    events: EventBus,
}

impl std::fmt::Debug for CallsController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallsController")
            .field("calls", &self.instances.len())
            .field("config", &self.config)
            .finish()
    }
}

impl CallsController {
    pub fn new(config: CallConfig, services: CallServices) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            config: Arc::new(config),
            services,
            instances: DashMap::new(),
            sorted: Mutex::new(Vec::new()),
            next_temporary_id: AtomicI64::new(-1),
            events: EventBus::new(),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn call_by_id(&self, id: CallId) -> Option<Arc<CallInstance>> {
        self.instances.get(&id).map(|entry| entry.value().clone())
    }

    /// Open call with the given user, if any.
    pub fn call_by_user_id(&self, user_id: UserId) -> Option<Arc<CallInstance>> {
        self.sorted
            .lock()
            .iter()
            .find(|c| c.interlocutor_user_id() == user_id && !c.is_closing())
            .cloned()
    }

    /// Highest-ranked open call.
    pub fn current_call(&self) -> Option<Arc<CallInstance>> {
        self.sorted.lock().iter().find(|c| !c.is_closing()).cloned()
    }

    /// Every tracked call, highest rank first.
    pub fn calls(&self) -> Vec<Arc<CallInstance>> {
        self.sorted.lock().clone()
    }

    /// Starts an outgoing call, or returns the open call with that user.
    pub async fn start_call(&self, user_id: UserId, video: bool) -> Result<Arc<CallInstance>, CallError> {
        if let Some(existing) = self.call_by_user_id(user_id) {
            info!("Already in a call with user {}", user_id);
            return Ok(existing);
        }

        let instance = CallInstance::new(self.services.clone(), self.config.clone(), user_id, true);
        self.attach(&instance);
        instance.override_connection_state(Some(CallState::Requesting));
        instance.set_temporary_id(self.next_temporary_id.fetch_sub(1, Ordering::SeqCst));

        if let Err(e) = instance.request_call(video).await {
            error!("Failed to request call with user {}: {}", user_id, e);
            instance.hang_up(e.hang_up_reason(), false).await;
            return Err(e);
        }
        Ok(instance)
    }

    pub async fn accept_call(&self, call_id: CallId) -> Result<(), CallError> {
        let instance = self.call_by_id(call_id).ok_or(CallError::NotFound(call_id))?;
        instance.accept_call().await;
        Ok(())
    }

    pub async fn discard_call(&self, call_id: CallId, reason: DiscardReason) -> Result<(), CallError> {
        let instance = self.call_by_id(call_id).ok_or(CallError::NotFound(call_id))?;
        instance.hang_up(reason, false).await;
        Ok(())
    }

    /// Hangs up every call.
    pub async fn shutdown(&self) {
        let calls = self.calls();
        info!("Shutting down {} calls", calls.len());
        for call in calls {
            call.hang_up(DiscardReason::Hangup, false).await;
        }
        self.instances.clear();
        self.sorted.lock().clear();
    }

    pub async fn handle_update(&self, update: CallUpdate) {
        match update {
            CallUpdate::PhoneCall(call) => self.on_phone_call(call).await,
            CallUpdate::SignalingData { call_id, data } => {
                let Some(instance) = self.call_by_id(call_id) else {
                    debug!("Signaling data for unknown call {}", call_id);
                    return;
                };
                instance.on_update_phone_call_signaling_data(data).await;
            }
        }
    }

    async fn on_phone_call(&self, call: PhoneCall) {
        let call_id = call.id();
        let instance = self.call_by_id(call_id);

        match (&call, instance) {
            (PhoneCall::Discarded { reason, .. }, Some(instance)) => {
                let reason = reason.unwrap_or(DiscardReason::Hangup);
                instance.hang_up(reason, true).await;
            }
            (PhoneCall::Requested { header, .. }, None) => {
                let instance = CallInstance::new(
                    self.services.clone(),
                    self.config.clone(),
                    header.admin_id,
                    false,
                );
                self.attach(&instance);
                instance.override_connection_state(Some(CallState::Pending));
                let compatible = self.check_protocol(&instance, &header.protocol);
                instance.set_phone_call(call.clone());

                if compatible {
                    instance.set_hang_up_timeout(self.config.hang_up_timeout, DiscardReason::Missed);
                } else {
                    instance.hang_up(DiscardReason::Disconnect, false).await;
                }
            }
            (PhoneCall::Accepted { header, .. }, Some(instance)) if instance.is_outgoing() => {
                if !self.check_protocol(&instance, &header.protocol) {
                    instance.hang_up(DiscardReason::Disconnect, false).await;
                    return;
                }
                instance.set_phone_call(call.clone());
                instance.confirm_call().await;
            }
            (PhoneCall::Established { .. }, Some(instance))
                if !instance.is_outgoing() && !instance.has_encryption_key() =>
            {
                if let Err(e) = self.on_call_keyed(&instance, call.clone()).await {
                    instance.terminate_with_error(e).await;
                }
            }
            (_, Some(instance)) => instance.set_phone_call(call.clone()),
            (_, None) => debug!("Update for unknown call {}", call_id),
        }
    }

    /// Verifies the caller's share against its commitment and derives the key
    /// on the accepting side.
    async fn on_call_keyed(&self, instance: &Arc<CallInstance>, call: PhoneCall) -> Result<(), CallError> {
        let PhoneCall::Established {
            g_a_or_b,
            key_fingerprint,
            ..
        } = &call
        else {
            return Ok(());
        };

        let dh = instance.dh_info();
        let g_a_hash = dh.g_a_hash.ok_or(CallError::MissingAttribute("g_a_hash"))?;
        if self.services.crypto.sha256(g_a_or_b) != g_a_hash {
            return Err(CallError::CryptoMismatch("g_a does not match its hash"));
        }

        let b = dh.b.ok_or(CallError::MissingAttribute("dh secret"))?;
        let computed = self.services.crypto.compute_key(g_a_or_b, &b, &dh.p).await?;
        if computed.fingerprint != *key_fingerprint {
            return Err(CallError::CryptoMismatch("key fingerprint"));
        }

        instance.set_encryption_key(computed, g_a_or_b)?;
        instance.set_phone_call(call);
        instance.join_call().await;
        Ok(())
    }

    fn check_protocol(&self, instance: &CallInstance, protocol: &CallProtocol) -> bool {
        if !self.config.verify_protocol_compatibility || self.config.protocol.is_compatible_with(protocol) {
            return true;
        }
        warn!(
            "User {} uses an incompatible call protocol {:?}",
            instance.interlocutor_user_id(),
            protocol
        );
        let _ = self.events.incompatible.send(Arc::new(PeerIncompatible {
            user_id: instance.interlocutor_user_id(),
        }));
        false
    }

    fn attach(&self, instance: &Arc<CallInstance>) {
        let controller = self.weak_self.clone();
        let call = Arc::downgrade(instance);
        instance.add_event_listener(move |event| {
            if let (Some(controller), Some(call)) = (controller.upgrade(), call.upgrade()) {
                controller.on_call_event(&call, event);
            }
        });
        self.sorted.lock().push(instance.clone());
    }

    fn on_call_event(&self, call: &Arc<CallInstance>, event: &CallEvent) {
        match event {
            CallEvent::Id { id, prev } => {
                if let Some(prev) = prev {
                    self.instances.remove(prev);
                }
                if call.connection_state() == CallState::Closed {
                    debug!("Call {} got its id after closing, not tracking it", id);
                    return;
                }
                self.instances.insert(*id, call.clone());
                debug!("Call {:?} is now tracked as {}", prev, id);

                if prev.is_none() {
                    let has_current_call = self
                        .current_call()
                        .is_some_and(|current| !Arc::ptr_eq(&current, call));
                    let _ = self.events.instance.send(Arc::new(CallInstanceCreated {
                        instance: call.clone(),
                        has_current_call,
                    }));
                }
            }
            CallEvent::State(state) => self.on_call_state(call, *state),
            CallEvent::Incompatible(user_id) => {
                let _ = self
                    .events
                    .incompatible
                    .send(Arc::new(PeerIncompatible { user_id: *user_id }));
            }
            _ => {}
        }
    }

    fn on_call_state(&self, call: &Arc<CallInstance>, state: CallState) {
        // Ranked before this transition, so a call that just closed is still primary.
        let primary = self.sorted.lock().first().cloned();

        if state == CallState::Closed {
            self.instances.retain(|_, c| !Arc::ptr_eq(c, call));
            self.sorted.lock().retain(|c| !Arc::ptr_eq(c, call));
        } else {
            self.sorted
                .lock()
                .sort_by_cached_key(|c| Reverse(c.sort_index()));
        }

        if let Some(call_id) = call.id() {
            let _ = self
                .events
                .call_state
                .send(Arc::new(CallStateChanged { call_id, state }));
        }

        if primary.is_none_or(|primary| Arc::ptr_eq(&primary, call)) {
            self.play_state_sound(call, state);
        }
    }

    fn play_state_sound(&self, call: &CallInstance, state: CallState) {
        let sounds = &self.services.sounds;
        match state {
            CallState::Closed => {
                if !call.is_outgoing() && !call.was_trying_to_join() {
                    sounds.stop();
                } else if call.was_trying_to_join() && !call.has_connected() {
                    sounds.play(CallSound::Failed, false);
                } else if call.discard_reason() == Some(DiscardReason::Busy) {
                    sounds.play(CallSound::Busy, false);
                } else {
                    sounds.play(CallSound::End, false);
                }
            }
            CallState::Pending => {
                let sound = if call.is_outgoing() {
                    CallSound::Outgoing
                } else {
                    CallSound::Incoming
                };
                sounds.play(sound, true);
            }
            CallState::ExchangingKeys => sounds.play_if_different(CallSound::Connect),
            CallState::Connecting if call.has_connected() => sounds.play(CallSound::Connecting, true),
            _ => sounds.stop(),
        }
    }
}

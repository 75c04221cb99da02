//! Synchronous per-call event listeners.

use parking_lot::Mutex;
use std::sync::Arc;

use super::media::{MediaState, RemoteTrack};
use super::state::CallState;
use crate::types::call::{CallId, UserId};

/// Something that happened to one call.
#[derive(Debug, Clone)]
pub enum CallEvent {
    State(CallState),
    /// The call got a (new) id. `prev` is `None` the first time.
    Id { id: CallId, prev: Option<CallId> },
    Muted(bool),
    MediaState(MediaState),
    Track(RemoteTrack),
    /// The peer sent something we cannot parse.
    Incompatible(UserId),
}

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registration-ordered listener list.
///
/// Dispatch runs on the caller's task and snapshots the list first, so a
/// listener may register further listeners or call back into the emitter.
pub struct EventListeners<E> {
    listeners: Mutex<Vec<Listener<E>>>,
}

impl<E> Default for EventListeners<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<E> EventListeners<E> {
    pub fn add(&self, listener: impl Fn(&E) + Send + Sync + 'static) {
        self.listeners.lock().push(Arc::new(listener));
    }

    pub fn dispatch(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self.listeners.lock().clone();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

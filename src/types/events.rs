use crate::calls::{CallInstance, CallState};
use crate::types::call::{CallId, UserId};
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// A call instance got its first id and is now tracked by the controller.
#[derive(Clone)]
pub struct CallInstanceCreated {
    pub instance: Arc<CallInstance>,
    /// Whether another call was already the primary call.
    pub has_current_call: bool,
}

impl std::fmt::Debug for CallInstanceCreated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallInstanceCreated")
            .field("call_id", &self.instance.id())
            .field("has_current_call", &self.has_current_call)
            .finish()
    }
}

/// The remote party speaks a protocol we cannot follow.
#[derive(Debug, Clone)]
pub struct PeerIncompatible {
    pub user_id: UserId,
}

#[derive(Debug, Clone)]
pub struct CallStateChanged {
    pub call_id: CallId,
    pub state: CallState,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (instance, Arc<CallInstanceCreated>),
    (incompatible, Arc<PeerIncompatible>),
    (call_state, Arc<CallStateChanged>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

//! Notification sounds driven by the primary call.

use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSound {
    Busy,
    Connect,
    End,
    Incoming,
    Outgoing,
    Failed,
    Connecting,
}

impl CallSound {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Busy => "call_busy",
            Self::Connect => "call_connect",
            Self::End => "call_end",
            Self::Incoming => "call_incoming",
            Self::Outgoing => "call_outgoing",
            Self::Failed => "voip_failed",
            Self::Connecting => "voip_connecting",
        }
    }
}

pub trait CallSoundPlayer: Send + Sync {
    fn play(&self, sound: CallSound, looped: bool);

    /// Plays `sound` unless it is already the current sound.
    fn play_if_different(&self, sound: CallSound);

    fn stop(&self);
}

/// Player for hosts without audio output; only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSoundPlayer;

impl CallSoundPlayer for LogSoundPlayer {
    fn play(&self, sound: CallSound, looped: bool) {
        debug!("Playing {} (looped: {})", sound.as_str(), looped);
    }

    fn play_if_different(&self, sound: CallSound) {
        debug!("Playing {} if different", sound.as_str());
    }

    fn stop(&self) {
        debug!("Stopping call sound");
    }
}

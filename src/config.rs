use crate::types::call::CallProtocol;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine-wide settings shared by the controller and every call instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Watchdog and PENDING timeout, in milliseconds on the wire.
    #[serde(with = "duration_ms")]
    pub hang_up_timeout: Duration,
    /// Coalescing window for media state pushes over the data channel.
    #[serde(with = "duration_ms")]
    pub media_state_debounce: Duration,
    pub protocol: CallProtocol,
    pub verify_protocol_compatibility: bool,
    /// When false only relay candidates are gathered.
    pub p2p_allowed: bool,
    pub data_channel_label: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            hang_up_timeout: Duration::from_secs(45),
            media_state_debounce: Duration::ZERO,
            protocol: CallProtocol::default(),
            verify_protocol_compatibility: false,
            p2p_allowed: true,
            data_channel_label: "data".to_string(),
        }
    }
}

impl CallConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&raw)?)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoState {
    #[default]
    Inactive,
    Paused,
    Active,
}

/// Media flags of one side of a call.
///
/// The local ("input") state is pushed to the peer over the data channel on
/// every change; the peer's ("output") state replaces ours wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub muted: bool,
    pub video_state: VideoState,
    pub screencast_state: VideoState,
    #[serde(default)]
    pub video_rotation: u16,
    #[serde(default)]
    pub low_battery: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            muted: true,
            video_state: VideoState::Inactive,
            screencast_state: VideoState::Inactive,
            video_rotation: 0,
            low_battery: false,
        }
    }
}

impl MediaState {
    pub fn has_video(&self) -> bool {
        self.video_state == VideoState::Active || self.screencast_state == VideoState::Active
    }
}

/// Messages carried by the call's data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum DataChannelPayload {
    MediaState(MediaState),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_state_wire_shape() {
        let payload = DataChannelPayload::MediaState(MediaState {
            muted: false,
            video_state: VideoState::Active,
            ..Default::default()
        });
        let json: serde_json::Value = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["@type"], "MediaState");
        assert_eq!(json["muted"], false);
        assert_eq!(json["videoState"], "active");
        assert_eq!(json["screencastState"], "inactive");
        assert_eq!(json["lowBattery"], false);
    }

    #[test]
    fn test_parse_peer_state() {
        let raw = r#"{"@type":"MediaState","muted":true,"videoState":"inactive","screencastState":"active","videoRotation":90}"#;
        let DataChannelPayload::MediaState(state) = serde_json::from_str(raw).unwrap();
        assert!(state.has_video());
        assert_eq!(state.video_rotation, 90);
        assert!(!state.low_battery);
    }
}

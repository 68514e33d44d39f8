use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::Result;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// Frame discriminator for the real-time channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Chat,
    MediaOffer,
    MediaAnswer,
    IceCandidate,
    PlaybackState,
    PlaybackControl,
    UserJoined,
    UserLeft,
}

/// How a frame of a given kind moves through the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Broadcast to everyone including the sender; persisted to the backlog.
    Chat,
    /// Point-to-point when a target is named, else broadcast excluding the
    /// sender.
    Signal,
    /// Broadcast excluding the sender; only the room's host may send it.
    HostControl,
    /// Generated by the hub itself; never accepted from a client.
    ServerEvent,
}

impl MessageKind {
    pub fn route(self) -> RouteClass {
        match self {
            Self::Chat => RouteClass::Chat,
            Self::MediaOffer | Self::MediaAnswer | Self::IceCandidate => RouteClass::Signal,
            Self::PlaybackState | Self::PlaybackControl => RouteClass::HostControl,
            Self::UserJoined | Self::UserLeft => RouteClass::ServerEvent,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The one frame shape on the wire.
///
/// `payload` is deliberately kept as raw JSON: the hub routes on `kind` and
/// `target_id` alone and never deserializes the payload.  Only the two
/// endpoints of a conversation agree on the payload structs below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Box<RawValue>,
    pub room_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Unix milliseconds, stamped by the server for inbound frames.
    pub timestamp: i64,
}

/// What a client actually sends: the routing envelope minus the fields the
/// server stamps itself (`room_id`, `sender_id`, `timestamp`).  Clients
/// cannot speak on behalf of another sender.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Box<RawValue>,
    #[serde(default)]
    pub target_id: Option<String>,
}

impl Envelope {
    /// Promote an inbound client frame to a full envelope.
    pub fn from_client(frame: ClientFrame, room_id: &str, sender_id: &str) -> Self {
        Self {
            kind: frame.kind,
            payload: frame.payload,
            room_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            target_id: frame.target_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Build a hub-generated frame (presence events).
    pub fn server_event(
        kind: MessageKind,
        payload: &impl Serialize,
        room_id: &str,
        subject_id: &str,
    ) -> Result<Self> {
        Ok(Self {
            kind,
            payload: serde_json::value::to_raw_value(payload)?,
            room_id: room_id.to_string(),
            sender_id: subject_id.to_string(),
            target_id: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Payload structs (endpoint contract — opaque to the hub)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub display_name: String,
    pub text: String,
}

/// Payload of `user-joined` / `user-left`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEventPayload {
    pub participant_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackAction {
    Play,
    Pause,
    SeekForward,
    SeekBackward,
    Toggle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackControlPayload {
    pub action: PlaybackAction,
    #[serde(default)]
    pub seek_seconds: f64,
}

/// Payload of `playback-state`: the host's periodic sync of the shared
/// player, as opposed to the one-shot commands above.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackStatePayload {
    pub playing: bool,
    pub current_time: f64,
    pub volume: f64,
}

/// Payload of `media-offer` / `media-answer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
}

/// Payload of `ice-candidate`, shaped like the W3C `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_kebab_case() {
        assert_eq!(serde_json::to_string(&MessageKind::MediaOffer).unwrap(), "\"media-offer\"");
        assert_eq!(serde_json::to_string(&MessageKind::IceCandidate).unwrap(), "\"ice-candidate\"");
        assert_eq!(serde_json::to_string(&MessageKind::UserJoined).unwrap(), "\"user-joined\"");

        let parsed: MessageKind = serde_json::from_str("\"playback-control\"").unwrap();
        assert_eq!(parsed, MessageKind::PlaybackControl);
    }

    #[test]
    fn routing_table() {
        assert_eq!(MessageKind::Chat.route(), RouteClass::Chat);
        assert_eq!(MessageKind::MediaOffer.route(), RouteClass::Signal);
        assert_eq!(MessageKind::MediaAnswer.route(), RouteClass::Signal);
        assert_eq!(MessageKind::IceCandidate.route(), RouteClass::Signal);
        assert_eq!(MessageKind::PlaybackState.route(), RouteClass::HostControl);
        assert_eq!(MessageKind::PlaybackControl.route(), RouteClass::HostControl);
        assert_eq!(MessageKind::UserJoined.route(), RouteClass::ServerEvent);
        assert_eq!(MessageKind::UserLeft.route(), RouteClass::ServerEvent);
    }

    #[test]
    fn client_frame_is_stamped() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"chat","payload":{"display_name":"BraveFox","text":"hi"}}"#)
                .unwrap();
        let envelope = Envelope::from_client(frame, "room-1", "p-1");

        assert_eq!(envelope.kind, MessageKind::Chat);
        assert_eq!(envelope.room_id, "room-1");
        assert_eq!(envelope.sender_id, "p-1");
        assert!(envelope.timestamp > 0);
    }

    #[test]
    fn sender_fields_in_client_frames_are_ignored() {
        // A client trying to spoof sender_id only has its payload kept.
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"chat","payload":{"display_name":"X","text":"hi"},"sender_id":"victim"}"#,
        )
        .unwrap();
        let envelope = Envelope::from_client(frame, "room-1", "actual-sender");
        assert_eq!(envelope.sender_id, "actual-sender");
    }

    #[test]
    fn payload_survives_verbatim() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"ice-candidate","payload":{"candidate":"candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host","sdpMid":"0"},"target_id":"p-2"}"#,
        )
        .unwrap();
        let envelope = Envelope::from_client(frame, "room-1", "p-1");
        let json = envelope.to_json().unwrap();

        assert!(json.contains("candidate:1 1 udp"));
        assert!(json.contains("\"sdpMid\":\"0\""));

        let back: Envelope = serde_json::from_str(&json).unwrap();
        let candidate: CandidatePayload = serde_json::from_str(back.payload.get()).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
    }

    #[test]
    fn server_event_shape() {
        let payload = UserEventPayload {
            participant_id: "p-9".into(),
            display_name: "CalmOwl".into(),
        };
        let envelope =
            Envelope::server_event(MessageKind::UserJoined, &payload, "room-1", "p-9").unwrap();
        let json = envelope.to_json().unwrap();

        assert!(json.contains("\"type\":\"user-joined\""));
        assert!(json.contains("\"participant_id\":\"p-9\""));
        assert!(!json.contains("target_id"));
    }

    #[test]
    fn unknown_kind_fails_to_parse() {
        let result = serde_json::from_str::<ClientFrame>(r#"{"type":"format-disk","payload":{}}"#);
        assert!(result.is_err());
    }
}

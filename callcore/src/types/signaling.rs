//! Signaling message definitions.
//!
//! Every frame on the signaling channel is a JSON object whose `type` field
//! selects one of the [`SignalingMessage`] variants. Field names follow the
//! browser conventions (`camelCase`, `RTCSessionDescriptionInit`,
//! `RTCIceCandidateInit`) so the same server can relay between web and native
//! clients.

use serde::{Deserialize, Deserializer, Serialize};

/// Kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP blob plus its kind, as exchanged in `offer` and `answer` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Messages carried by the signaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// The server paired us with a peer.
    #[serde(rename_all = "camelCase")]
    MatchFound {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        /// Older servers send the peer as a string `userId`, which may not
        /// be numeric at all.
        #[serde(
            default,
            alias = "userId",
            deserialize_with = "deserialize_peer_id",
            skip_serializing_if = "Option::is_none"
        )]
        peer_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// `Some(false)` tells this side to wait for the peer's offer.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiator: Option<bool>,
    },
    Offer {
        offer: SessionDescription,
    },
    Answer {
        answer: SessionDescription,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    UserDisconnected,
    MatchCancelled,
    Ping,
    Pong,
}

impl SignalingMessage {
    /// The `type` discriminator as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MatchFound { .. } => "match-found",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::UserDisconnected => "user-disconnected",
            Self::MatchCancelled => "match-cancelled",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Opaque peer ids decode as `None`; the match response already names the peer.
fn deserialize_peer_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPeerId {
        Number(i64),
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Option::<RawPeerId>::deserialize(deserializer)? {
        Some(RawPeerId::Number(n)) => Some(n),
        Some(RawPeerId::Text(s)) => s.trim().parse().ok(),
        Some(RawPeerId::Other(_)) | None => None,
    })
}

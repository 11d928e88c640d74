// Wire messages exchanged with the signaling relay.
// One JSON object per text frame, discriminated by "type".

use serde::{Deserialize, Serialize};

/// A participant's role within a space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    CoHost,
    Speaker,
    Listener,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP offer or answer, in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// One trickled ICE candidate, in the browser's `RTCIceCandidateInit` shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Messages carried by the signaling channel.
///
/// Negotiation messages name both ends so the relay can route them without
/// understanding conference semantics; roster messages are broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    UserJoined {
        #[serde(rename = "userId")]
        user_id: String,
        role: Role,
    },
    UserLeft {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Offer {
        from: String,
        to: String,
        offer: SessionDescription,
    },
    Answer {
        from: String,
        to: String,
        answer: SessionDescription,
    },
    IceCandidate {
        from: String,
        to: String,
        candidate: IceCandidate,
    },
}

impl SignalingMessage {
    /// Recipient of a routed message; `None` for broadcasts.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::IceCandidate { to, .. } => {
                Some(to)
            }
            Self::UserJoined { .. } | Self::UserLeft { .. } => None,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_joined_matches_wire_shape() {
        let msg = SignalingMessage::UserJoined { user_id: "u1".into(), role: Role::CoHost };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "user-joined", "userId": "u1", "role": "co_host"})
        );
    }

    #[test]
    fn parses_browser_ice_candidate() {
        let raw = r#"{
            "type": "ice-candidate",
            "from": "a",
            "to": "b",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        }"#;
        let msg: SignalingMessage = serde_json::from_str(raw).unwrap();
        match msg {
            SignalingMessage::IceCandidate { from, to, candidate } => {
                assert_eq!(from, "a");
                assert_eq!(to, "b");
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn candidate_without_mid_defaults_to_none() {
        let raw = r#"{"candidate": "candidate:2 1 udp 1 1.2.3.4 9 typ srflx"}"#;
        let cand: IceCandidate = serde_json::from_str(raw).unwrap();
        assert_eq!(cand.sdp_mid, None);
        assert_eq!(cand.sdp_mline_index, None);
    }

    #[test]
    fn offer_carries_typed_sdp() {
        let msg = SignalingMessage::Offer {
            from: "a".into(),
            to: "b".into(),
            offer: SessionDescription::offer("v=0"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["offer"], json!({"type": "offer", "sdp": "v=0"}));
        assert_eq!(msg.recipient(), Some("b"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type": "kick", "userId": "x"}"#;
        assert!(serde_json::from_str::<SignalingMessage>(raw).is_err());
    }
}

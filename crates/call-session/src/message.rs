use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Which side of the negotiation a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Initiator,
    Joiner,
}

impl SessionRole {
    pub fn remote(self) -> Self {
        match self {
            SessionRole::Initiator => SessionRole::Joiner,
            SessionRole::Joiner => SessionRole::Initiator,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque session-description blob. The wire shape matches browser
/// `RTCSessionDescription` JSON (`{"type": ..., "sdp": ...}`), so a
/// browser peer can read it as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptionBlob {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// Opaque connectivity-candidate blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateBlob {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// Message exchanged through the signaling store.
///
/// Candidate batches always carry the full accumulated list, not deltas:
/// the store offers no atomic append, so a lost write is repaired by the
/// next republication and duplicate application is idempotent downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    Offer {
        session_id: String,
        description: SessionDescriptionBlob,
    },
    Answer {
        session_id: String,
        description: SessionDescriptionBlob,
    },
    CandidateBatch {
        session_id: String,
        candidates: Vec<CandidateBlob>,
    },
}

impl SignalingMessage {
    pub fn session_id(&self) -> &str {
        match self {
            SignalingMessage::Offer { session_id, .. }
            | SignalingMessage::Answer { session_id, .. }
            | SignalingMessage::CandidateBatch { session_id, .. } => session_id,
        }
    }

    /// Store key this message lives under, derived from the message kind,
    /// the session id, and (for candidate batches) the publishing role.
    pub fn channel_key(&self, from: SessionRole) -> String {
        match self {
            SignalingMessage::Offer { session_id, .. } => offer_key(session_id),
            SignalingMessage::Answer { session_id, .. } => answer_key(session_id),
            SignalingMessage::CandidateBatch { session_id, .. } => {
                candidates_key(session_id, from)
            }
        }
    }

    pub fn encode(&self) -> Result<String, SessionError> {
        serde_json::to_string(self)
            .map_err(|err| SessionError::Negotiation(format!("encode signaling message: {err}")))
    }

    pub fn decode(raw: &str) -> Result<Self, SessionError> {
        serde_json::from_str(raw)
            .map_err(|err| SessionError::Negotiation(format!("malformed signaling payload: {err}")))
    }
}

pub fn offer_key(session_id: &str) -> String {
    format!("session:{}:offer", session_id)
}

pub fn answer_key(session_id: &str) -> String {
    format!("session:{}:answer", session_id)
}

pub fn candidates_key(session_id: &str, from: SessionRole) -> String {
    match from {
        SessionRole::Initiator => format!("session:{}:candidates:from_initiator", session_id),
        SessionRole::Joiner => format!("session:{}:candidates:from_joiner", session_id),
    }
}

/// All keys a session may have published, for teardown.
pub fn session_keys(session_id: &str) -> [String; 4] {
    [
        offer_key(session_id),
        answer_key(session_id),
        candidates_key(session_id, SessionRole::Initiator),
        candidates_key(session_id, SessionRole::Joiner),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_blob() -> SessionDescriptionBlob {
        SessionDescriptionBlob {
            kind: SdpKind::Offer,
            sdp: "v=0\r\n".into(),
        }
    }

    #[test]
    fn key_scheme_is_deterministic() {
        assert_eq!(offer_key("abcde"), "session:abcde:offer");
        assert_eq!(answer_key("abcde"), "session:abcde:answer");
        assert_eq!(
            candidates_key("abcde", SessionRole::Initiator),
            "session:abcde:candidates:from_initiator"
        );
        assert_eq!(
            candidates_key("abcde", SessionRole::Joiner),
            "session:abcde:candidates:from_joiner"
        );
        assert_eq!(session_keys("abcde").len(), 4);
    }

    #[test]
    fn channel_key_ignores_role_for_descriptions() {
        let offer = SignalingMessage::Offer {
            session_id: "abcde".into(),
            description: offer_blob(),
        };
        assert_eq!(
            offer.channel_key(SessionRole::Initiator),
            offer.channel_key(SessionRole::Joiner)
        );

        let batch = SignalingMessage::CandidateBatch {
            session_id: "abcde".into(),
            candidates: Vec::new(),
        };
        assert_ne!(
            batch.channel_key(SessionRole::Initiator),
            batch.channel_key(SessionRole::Joiner)
        );
    }

    #[test]
    fn description_blob_uses_browser_wire_shape() {
        let encoded = serde_json::to_string(&offer_blob()).unwrap();
        assert!(encoded.contains(r#""type":"offer""#));
        assert!(encoded.contains(r#""sdp""#));
    }

    #[test]
    fn messages_round_trip_through_the_tagged_encoding() {
        let message = SignalingMessage::CandidateBatch {
            session_id: "abcde".into(),
            candidates: vec![CandidateBlob {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }],
        };
        assert_eq!(message.session_id(), "abcde");
        let encoded = message.encode().unwrap();
        assert!(encoded.contains(r#""type":"candidate_batch""#));
        assert_eq!(SignalingMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn decode_rejects_garbage_as_negotiation_error() {
        let err = SignalingMessage::decode("{not json").unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(_)));
        assert!(err.to_string().contains("malformed"));
    }
}

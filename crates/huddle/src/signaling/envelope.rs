use serde::{Deserialize, Serialize};

use crate::identity::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    Offer,
    Answer,
    IceCandidate,
    Presence,
    StatusUpdate,
    ParticipantLeft,
    Renegotiate,
    /// Emitted after the room log was wiped to recover from storage exhaustion.
    ChannelReset,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::IceCandidate => "ice-candidate",
            EnvelopeKind::Presence => "presence",
            EnvelopeKind::StatusUpdate => "status-update",
            EnvelopeKind::ParticipantLeft => "participant-left",
            EnvelopeKind::Renegotiate => "renegotiate",
            EnvelopeKind::ChannelReset => "channel-reset",
        }
    }

    /// Negotiation kinds must be applied at most once per receiver.
    pub fn is_deduplicated(self) -> bool {
        matches!(
            self,
            EnvelopeKind::Offer | EnvelopeKind::Answer | EnvelopeKind::IceCandidate
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantMetadata {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub camera_on: bool,
    #[serde(default)]
    pub mic_on: bool,
    #[serde(default)]
    pub screen_sharing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
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

impl IceCandidatePayload {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// One message on the room log. `sender` and `timestamp` are stamped by the channel
/// when the envelope is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub sender: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidatePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ParticipantMetadata>,
    pub timestamp: u64,
}

impl SignalingEnvelope {
    pub fn new(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            sender: SessionId::new(),
            target: None,
            sdp: None,
            candidate: None,
            metadata: None,
            timestamp: 0,
        }
    }

    pub fn to(mut self, target: impl Into<SessionId>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_sdp(mut self, sdp: impl Into<String>) -> Self {
        self.sdp = Some(sdp.into());
        self
    }

    pub fn with_candidate(mut self, candidate: IceCandidatePayload) -> Self {
        self.candidate = Some(candidate);
        self
    }

    pub fn with_metadata(mut self, metadata: ParticipantMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_addressed_to(&self, session_id: &str) -> bool {
        self.target.as_deref().map_or(true, |target| target == session_id)
    }

    pub fn dedupe_key(&self) -> String {
        format!("{}|{}|{}", self.sender, self.kind.as_str(), self.timestamp)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_uses_browser_field_names_and_omits_absent_fields() {
        let mut candidate = IceCandidatePayload::new("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host");
        candidate.sdp_mid = Some("0".into());
        candidate.sdp_mline_index = Some(0);
        let mut envelope = SignalingEnvelope::new(EnvelopeKind::IceCandidate)
            .to("b2")
            .with_candidate(candidate);
        envelope.sender = "a1".into();
        envelope.timestamp = 42;

        let value: serde_json::Value =
            serde_json::from_str(&envelope.to_json().expect("serialize")).expect("json");
        assert_eq!(
            value,
            json!({
                "type": "ice-candidate",
                "sender": "a1",
                "target": "b2",
                "candidate": {
                    "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                },
                "timestamp": 42
            })
        );
    }

    #[test]
    fn parses_presence_from_another_client() {
        let raw = r#"{"type":"presence","sender":"b2","metadata":{"displayName":"Bob","cameraOn":true,"micOn":false,"screenSharing":false},"timestamp":1700000000000}"#;
        let envelope = SignalingEnvelope::from_json(raw).expect("parse");
        assert_eq!(envelope.kind, EnvelopeKind::Presence);
        assert_eq!(envelope.target, None);
        assert!(envelope.is_addressed_to("anyone"));
        let metadata = envelope.metadata.expect("metadata");
        assert_eq!(metadata.display_name, "Bob");
        assert!(metadata.camera_on);
    }

    #[test]
    fn metadata_without_display_name_still_parses() {
        let raw = r#"{"type":"offer","sender":"b2","sdp":"v=0","metadata":{"cameraOn":true},"timestamp":7}"#;
        let envelope = SignalingEnvelope::from_json(raw).expect("parse");
        assert_eq!(envelope.kind, EnvelopeKind::Offer);
        let metadata = envelope.metadata.expect("metadata");
        assert_eq!(metadata.display_name, "");
        assert!(metadata.camera_on);
        assert!(!metadata.mic_on);
    }

    #[test]
    fn unknown_kinds_fail_to_parse() {
        let raw = r#"{"type":"emoji-reaction","sender":"b2","timestamp":1}"#;
        assert!(SignalingEnvelope::from_json(raw).is_err());
    }

    #[test]
    fn kebab_case_kinds_round_trip_through_as_str() {
        for kind in [
            EnvelopeKind::Offer,
            EnvelopeKind::Answer,
            EnvelopeKind::IceCandidate,
            EnvelopeKind::Presence,
            EnvelopeKind::StatusUpdate,
            EnvelopeKind::ParticipantLeft,
            EnvelopeKind::Renegotiate,
            EnvelopeKind::ChannelReset,
        ] {
            let encoded = serde_json::to_value(kind).expect("serialize");
            assert_eq!(encoded, serde_json::Value::String(kind.as_str().to_string()));
        }
        assert!(!EnvelopeKind::Presence.is_deduplicated());
        assert!(EnvelopeKind::IceCandidate.is_deduplicated());
    }

    #[test]
    fn targeted_envelopes_reach_only_their_target() {
        let envelope = SignalingEnvelope::new(EnvelopeKind::Answer).to("a1");
        assert!(envelope.is_addressed_to("a1"));
        assert!(!envelope.is_addressed_to("c3"));
    }
}

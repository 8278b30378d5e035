use serde::{Deserialize, Serialize};

use crate::payload::ChannelId;

/// One unit exchanged between two multiplexers, carried in one frame.
///
/// Serialized as a JSON object discriminated by `"kind"`:
///
/// ```text
/// {"kind":"open_request","id":1,"payload_type":"reading.temperature","supertypes":["reading"]}
/// {"kind":"accept","id":1}
/// {"kind":"decline","id":1,"reason":"busy"}
/// {"kind":"payload","id":1,"payload":{"value":21.5,"unit":"C"}}
/// {"kind":"close","id":1}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Ask the peer to open channel `id` carrying `payload_type`.
    OpenRequest {
        id: ChannelId,
        payload_type: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        supertypes: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial: Option<serde_json::Value>,
    },
    /// The peer accepted channel `id`.
    Accept { id: ChannelId },
    /// The peer rejected channel `id`.
    Decline {
        id: ChannelId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Channel `id` is closed by the sender.
    Close { id: ChannelId },
    /// Application message on channel `id`.
    Payload {
        id: ChannelId,
        payload: serde_json::Value,
    },
}

impl Envelope {
    /// Channel this envelope concerns.
    pub fn id(&self) -> ChannelId {
        match self {
            Envelope::OpenRequest { id, .. }
            | Envelope::Accept { id }
            | Envelope::Decline { id, .. }
            | Envelope::Close { id }
            | Envelope::Payload { id, .. } => *id,
        }
    }

    /// Wire name of the envelope kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::OpenRequest { .. } => "open_request",
            Envelope::Accept { .. } => "accept",
            Envelope::Decline { .. } => "decline",
            Envelope::Close { .. } => "close",
            Envelope::Payload { .. } => "payload",
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn open_request_wire_shape() {
        let envelope = Envelope::OpenRequest {
            id: ChannelId(3),
            payload_type: "reading.temperature".to_string(),
            supertypes: vec!["reading".to_string()],
            initial: None,
        };
        let value: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "open_request",
                "id": 3,
                "payload_type": "reading.temperature",
                "supertypes": ["reading"]
            })
        );
    }

    #[test]
    fn optional_fields_default_when_absent() {
        let decline = Envelope::from_bytes(br#"{"kind":"decline","id":9}"#).unwrap();
        assert_eq!(
            decline,
            Envelope::Decline {
                id: ChannelId(9),
                reason: None
            }
        );

        let open = Envelope::from_bytes(br#"{"kind":"open_request","id":1,"payload_type":"x"}"#)
            .unwrap();
        assert!(matches!(
            open,
            Envelope::OpenRequest { ref supertypes, initial: None, .. } if supertypes.is_empty()
        ));
    }

    #[test]
    fn payload_carries_arbitrary_json() {
        let bytes = br#"{"kind":"payload","id":5,"payload":{"value":21.5,"tags":["a"]}}"#;
        let envelope = Envelope::from_bytes(bytes).unwrap();
        assert_eq!(envelope.id(), ChannelId(5));
        assert_eq!(envelope.kind(), "payload");
        match envelope {
            Envelope::Payload { payload, .. } => assert_eq!(payload["tags"][0], "a"),
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_rejected() {
        assert!(Envelope::from_bytes(br#"{"kind":"reset","id":1}"#).is_err());
    }
}

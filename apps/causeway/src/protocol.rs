use negotiation_webrtc::CandidateInit;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Frames a client may send, after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Offer { sdp: String },
    Ice { candidate: CandidateInit },
    Pong,
    Unknown(String),
}

/// Frames the relay sends back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Answer { sdp: String },
    Ice { candidate: CandidateInit },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(serde_json::Error),
    #[error("frame has no string type tag")]
    MissingType,
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct OfferPayload {
    sdp: String,
}

#[derive(Debug, Deserialize)]
struct IcePayload {
    candidate: CandidateInit,
}

/// Two-step decode: classify by the type tag first, then validate the
/// payload against the schema for that type.
pub fn decode(raw: &str) -> Result<Inbound, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(DecodeError::Malformed)?;
    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err(DecodeError::MissingType),
    };

    match kind.as_str() {
        "offer" => {
            let payload: OfferPayload = serde_json::from_value(value)
                .map_err(|source| DecodeError::Payload { kind: "offer", source })?;
            Ok(Inbound::Offer { sdp: payload.sdp })
        }
        "ice" => {
            let payload: IcePayload = serde_json::from_value(value)
                .map_err(|source| DecodeError::Payload { kind: "ice", source })?;
            Ok(Inbound::Ice {
                candidate: payload.candidate,
            })
        }
        "pong" => Ok(Inbound::Pong),
        _ => Ok(Inbound::Unknown(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn decodes_valid_offer() {
        let decoded = decode(r#"{"type":"offer","sdp":"v=0\r\no=- 0 0 IN IP4 0.0.0.0"}"#)
            .expect("valid offer");
        assert_eq!(
            decoded,
            Inbound::Offer {
                sdp: "v=0\r\no=- 0 0 IN IP4 0.0.0.0".to_string()
            }
        );
    }

    #[test_timeout::timeout]
    fn offer_payload_must_carry_string_sdp() {
        let missing = decode(r#"{"type":"offer"}"#).expect_err("missing sdp");
        assert!(matches!(missing, DecodeError::Payload { kind: "offer", .. }));

        let wrong_type = decode(r#"{"type":"offer","sdp":42}"#).expect_err("numeric sdp");
        assert!(matches!(wrong_type, DecodeError::Payload { kind: "offer", .. }));
    }

    #[test_timeout::timeout]
    fn decodes_ice_with_and_without_optional_fields() {
        let full = decode(
            r#"{"type":"ice","candidate":{"candidate":"candidate:1 1 udp 1 192.0.2.1 3478 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .expect("full candidate");
        match full {
            Inbound::Ice { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("expected ice frame, got {other:?}"),
        }

        let minimal = decode(r#"{"type":"ice","candidate":{"candidate":"candidate:2"}}"#)
            .expect("minimal candidate");
        match minimal {
            Inbound::Ice { candidate } => {
                assert_eq!(candidate.sdp_mid, None);
                assert_eq!(candidate.sdp_mline_index, None);
            }
            other => panic!("expected ice frame, got {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn ice_payload_is_validated() {
        let missing = decode(r#"{"type":"ice"}"#).expect_err("missing candidate");
        assert!(matches!(missing, DecodeError::Payload { kind: "ice", .. }));

        let not_an_object =
            decode(r#"{"type":"ice","candidate":"candidate:1"}"#).expect_err("string candidate");
        assert!(matches!(not_an_object, DecodeError::Payload { kind: "ice", .. }));

        let negative_index =
            decode(r#"{"type":"ice","candidate":{"candidate":"candidate:1","sdpMLineIndex":-1}}"#)
                .expect_err("negative mline index");
        assert!(matches!(negative_index, DecodeError::Payload { kind: "ice", .. }));
    }

    #[test_timeout::timeout]
    fn pong_and_unknown_types_pass_through() {
        assert_eq!(decode(r#"{"type":"pong"}"#).expect("pong"), Inbound::Pong);
        assert_eq!(
            decode(r#"{"type":"shrug","x":1}"#).expect("unknown"),
            Inbound::Unknown("shrug".to_string())
        );
    }

    #[test_timeout::timeout]
    fn non_json_input_is_malformed() {
        let err = decode("{definitely not json").expect_err("garbage");
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test_timeout::timeout]
    fn type_tag_must_be_a_string() {
        assert!(matches!(
            decode(r#"{"sdp":"v=0"}"#).expect_err("no tag"),
            DecodeError::MissingType
        ));
        assert!(matches!(
            decode(r#"{"type":5}"#).expect_err("numeric tag"),
            DecodeError::MissingType
        ));
        assert!(matches!(
            decode(r#"[1,2,3]"#).expect_err("array"),
            DecodeError::MissingType
        ));
    }

    #[test_timeout::timeout]
    fn server_frames_serialize_to_wire_shape() {
        let answer = serde_json::to_value(ServerFrame::Answer {
            sdp: "v=0".to_string(),
        })
        .expect("serialize answer");
        assert_eq!(answer, json!({"type": "answer", "sdp": "v=0"}));

        let ice = serde_json::to_value(ServerFrame::Ice {
            candidate: negotiation_webrtc::CandidateInit {
                candidate: "candidate:1".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        })
        .expect("serialize ice");
        assert_eq!(ice["type"], "ice");
        assert_eq!(ice["candidate"]["candidate"], "candidate:1");
        assert_eq!(ice["candidate"]["sdpMid"], "0");
        assert_eq!(ice["candidate"]["sdpMLineIndex"], 0);
        assert!(ice["candidate"].get("usernameFragment").is_none());
    }
}

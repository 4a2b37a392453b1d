//! Encode/decode envelopes to and from UTF-8 JSON text.
//!
//! Decoding goes through [`serde_json::Value`] first rather than straight to
//! [`Envelope`] so that a frame missing `packet_id`, `type` or `data` reports
//! [`Error::UnknownPacket`] instead of an opaque serde error.

use crate::error::{Error, Result};
use crate::packet::Envelope;

/// Something that can be turned into an [`Envelope`] without a fallible parse.
///
/// Lets callers that already hold a decoded object (for example, a host
/// framework that parsed the JSON itself before handing it to the Router)
/// skip the text round trip entirely.
pub enum Frame {
    Text(String),
    Decoded(Envelope),
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<Envelope> for Frame {
    fn from(envelope: Envelope) -> Self {
        Frame::Decoded(envelope)
    }
}

/// Serialize an envelope to canonical JSON text.
pub fn encode(envelope: &Envelope) -> Result<String> {
    serde_json::to_string(envelope)
        .map_err(|e| Error::UnknownPacket(format!("failed to encode envelope: {e}")))
}

/// Parse a frame into an [`Envelope`], validating the presence of the three
/// required keys along the way.
pub fn decode(frame: Frame) -> Result<Envelope> {
    match frame {
        Frame::Decoded(envelope) => Ok(envelope),
        Frame::Text(text) => decode_text(&text),
    }
}

fn decode_text(text: &str) -> Result<Envelope> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| Error::UnknownPacket(format!("not valid JSON: {e}")))?;

    let obj = value
        .as_object()
        .ok_or_else(|| Error::UnknownPacket("envelope was not a JSON object".to_string()))?;

    if !obj.contains_key("packet_id") {
        return Err(Error::UnknownPacket("missing 'packet_id' field".to_string()));
    }
    if !obj.contains_key("type") {
        return Err(Error::UnknownPacket("missing 'type' field".to_string()));
    }
    if !obj.contains_key("data") {
        return Err(Error::UnknownPacket("missing 'data' field".to_string()));
    }

    serde_json::from_value(value)
        .map_err(|e| Error::UnknownPacket(format!("malformed envelope: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::EnvelopeType;
    use serde_json::json;

    #[test]
    fn encode_then_decode_round_trips() {
        let envelope = Envelope::request("deadbeef", json!({"a": 1}));
        let text = encode(&envelope).unwrap();
        let decoded = decode(Frame::Text(text)).unwrap();
        assert_eq!(decoded.packet_id, envelope.packet_id);
        assert_eq!(decoded.r#type, EnvelopeType::Request);
        assert_eq!(decoded.data, envelope.data);
    }

    #[test]
    fn missing_packet_id_is_unknown_packet() {
        let text = json!({"type": "request", "data": {}}).to_string();
        let err = decode(Frame::Text(text)).unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_PACKET");
    }

    #[test]
    fn missing_type_is_unknown_packet() {
        let text = json!({"packet_id": "x", "data": {}}).to_string();
        assert!(decode(Frame::Text(text)).is_err());
    }

    #[test]
    fn missing_data_is_unknown_packet() {
        let text = json!({"packet_id": "x", "type": "request"}).to_string();
        assert!(decode(Frame::Text(text)).is_err());
    }

    #[test]
    fn non_object_frame_is_rejected() {
        let text = json!([1, 2, 3]).to_string();
        assert!(decode(Frame::Text(text)).is_err());
    }

    #[test]
    fn pre_decoded_envelope_skips_the_json_parse() {
        let envelope = Envelope::response("id1", json!(null));
        let decoded = decode(Frame::Decoded(envelope.clone())).unwrap();
        assert_eq!(decoded.packet_id, envelope.packet_id);
    }
}

//! Inbound payload decoding
//!
//! Broker payloads arrive either as plain UTF-8 text or as base64-encoded
//! text (usually JSON). There is no encoding tag on the wire, so the decoder
//! relies on a heuristic: anything made purely of base64-alphabet characters
//! is tried as base64 first.
//!
//! Known limitation: plain text that happens to consist only of base64
//! characters decodes as base64 whenever the bytes form valid UTF-8, so a
//! literal `dGVzdA` reaches listeners as `test`. An explicit encoding flag in
//! the envelope would remove the ambiguity; the heuristic is kept for
//! compatibility with existing publishers.
//!
//! Decoded JSON is re-serialized compactly with `serde_json`, which is not
//! byte-identical to a JavaScript `JSON.stringify` of the same document in
//! two cases. Floats with a zero fraction keep it (`1.0` stays `1.0`, not
//! `1`). Object keys keep their wire order, so integer-like keys are not
//! hoisted ahead of the others. Listeners that compare payload text rather
//! than parsed values see these differences.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

static BASE64_ALPHABET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/=]+$").expect("base64 alphabet regex"));

/// Standard alphabet, padding optional on decode
const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Pure decoding pipeline for raw inbound payloads
pub struct PayloadDecoder;

impl PayloadDecoder {
    /// Decode a raw payload string. Never fails: every error path falls back
    /// to returning the input unchanged.
    pub fn decode(raw: &str) -> String {
        if !Self::looks_like_base64(raw) {
            return raw.to_string();
        }

        let text = match Self::decode_base64_text(raw) {
            Some(text) => text,
            None => {
                debug!(len = raw.len(), "payload matched base64 alphabet but did not decode");
                return raw.to_string();
            }
        };

        match serde_json::from_str::<Value>(&text) {
            Ok(value) => value.to_string(),
            Err(_) => text,
        }
    }

    /// Decode a payload as delivered by the broker
    pub fn decode_bytes(raw: &[u8]) -> String {
        Self::decode(&String::from_utf8_lossy(raw))
    }

    /// Whether the payload consists only of base64-alphabet characters.
    /// The empty string is not base64.
    pub fn looks_like_base64(raw: &str) -> bool {
        BASE64_ALPHABET.is_match(raw)
    }

    /// Encode a JSON value the way publishers that use the base64 form do
    pub fn encode_json(value: &Value) -> String {
        base64::engine::general_purpose::STANDARD.encode(value.to_string())
    }

    fn decode_base64_text(raw: &str) -> Option<String> {
        let bytes = LENIENT_STANDARD.decode(raw).ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_decodes_base64_json() {
        assert_eq!(PayloadDecoder::decode("eyJ0eXBlIjoidGV4dCJ9"), r#"{"type":"text"}"#);
    }

    #[test]
    fn test_json_is_reserialized_canonically() {
        let encoded = STANDARD.encode("{ \"b\" : 1,\n  \"a\" : [1, 2] }");
        assert_eq!(PayloadDecoder::decode(&encoded), r#"{"b":1,"a":[1,2]}"#);
    }

    #[test]
    fn test_reserialization_keeps_floats_and_key_order() {
        let encoded = STANDARD.encode(r#"{"b": 1.0, "10": 2, "a": 3}"#);
        assert_eq!(PayloadDecoder::decode(&encoded), r#"{"b":1.0,"10":2,"a":3}"#);
    }

    #[test]
    fn test_base64_non_json_returns_decoded_text() {
        let encoded = STANDARD.encode("hello there");
        assert_eq!(PayloadDecoder::decode(&encoded), "hello there");
    }

    #[test]
    fn test_unpadded_base64_is_accepted() {
        let encoded = STANDARD.encode("{\"a\":1}");
        let unpadded = encoded.trim_end_matches('=');
        assert_ne!(encoded, unpadded);
        assert_eq!(PayloadDecoder::decode(unpadded), r#"{"a":1}"#);
    }

    #[test]
    fn test_empty_payload_is_not_base64() {
        assert!(!PayloadDecoder::looks_like_base64(""));
        assert_eq!(PayloadDecoder::decode(""), "");
    }

    #[test]
    fn test_plain_text_with_spaces_unchanged() {
        assert_eq!(PayloadDecoder::decode("hello world"), "hello world");
        assert_eq!(PayloadDecoder::decode(r#"{"type":"text"}"#), r#"{"type":"text"}"#);
    }

    #[test]
    fn test_invalid_base64_falls_back_to_raw() {
        // five characters can never be a complete base64 quantum
        assert_eq!(PayloadDecoder::decode("hello"), "hello");
        assert_eq!(PayloadDecoder::decode("ab=c"), "ab=c");
    }

    #[test]
    fn test_non_utf8_bytes_fall_back_to_raw() {
        // "true" decodes to 0xb6 0xbb 0x9e, which is not UTF-8
        assert_eq!(PayloadDecoder::decode("true"), "true");
    }

    #[test]
    fn test_alphabet_only_text_is_misdecoded() {
        // a plain word made of alphabet characters is taken as base64
        assert_eq!(PayloadDecoder::decode("dGVzdA"), "test");
    }

    #[test]
    fn test_decode_bytes() {
        assert_eq!(
            PayloadDecoder::decode_bytes(b"eyJ0eXBlIjoidGV4dCJ9"),
            r#"{"type":"text"}"#
        );
    }

    #[test]
    fn test_encode_json_round_trip() {
        let value = json!({
            "type": "buttons",
            "buttons": [{"id": "1", "title": "Yes", "type": "reply"}]
        });
        let decoded = PayloadDecoder::decode(&PayloadDecoder::encode_json(&value));
        assert_eq!(serde_json::from_str::<Value>(&decoded).unwrap(), value);
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 _.-]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn base64_json_round_trips(value in arb_json()) {
            let encoded = STANDARD.encode(value.to_string());
            let decoded = PayloadDecoder::decode(&encoded);
            let parsed: Value = serde_json::from_str(&decoded).unwrap();
            prop_assert_eq!(parsed, value);
        }

        #[test]
        fn text_with_space_is_unchanged(prefix in "[^ ]{0,16}", suffix in ".{0,16}") {
            let text = format!("{prefix} {suffix}");
            prop_assert_eq!(PayloadDecoder::decode(&text), text);
        }
    }
}

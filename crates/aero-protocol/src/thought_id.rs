//! Thinking-id codec.
//!
//! Clients that round-trip tool-call ids verbatim give us a free side channel:
//! a signature appended to the id survives the client's tool loop even when
//! every other custom field is stripped. `decode` splits on the first
//! occurrence of the separator, so a natural id containing the separator
//! still round-trips (`encode` only ever appends).

use aero_core::config::MIN_SIGNATURE_LEN;

/// Magic separator between a tool id and an appended signature.
pub const THOUGHT_SEPARATOR: &str = "__thought__";

/// Append `signature` to `tool_id` when present.
pub fn encode(tool_id: &str, signature: Option<&str>) -> String {
    match signature {
        Some(sig) if !sig.is_empty() => format!("{tool_id}{THOUGHT_SEPARATOR}{sig}"),
        _ => tool_id.to_string(),
    }
}

/// Split an encoded id back into (tool_id, signature).
///
/// Signatures below the validity floor are treated as absent but still
/// removed from the id — a mangled suffix must not leak upstream.
pub fn decode(encoded: &str) -> (String, Option<String>) {
    match encoded.split_once(THOUGHT_SEPARATOR) {
        Some((id, sig)) => {
            let signature = if sig.len() >= MIN_SIGNATURE_LEN {
                Some(sig.to_string())
            } else {
                None
            };
            (id.to_string(), signature)
        }
        None => (encoded.to_string(), None),
    }
}

/// Whether an id carries an encoded signature.
pub fn is_encoded(id: &str) -> bool {
    id.contains(THOUGHT_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_signature() {
        let sig = "a".repeat(200);
        let encoded = encode("call_abc", Some(&sig));
        assert_eq!(decode(&encoded), ("call_abc".to_string(), Some(sig)));
    }

    #[test]
    fn round_trips_without_signature() {
        assert_eq!(encode("call_abc", None), "call_abc");
        assert_eq!(decode("call_abc"), ("call_abc".to_string(), None));
    }

    #[test]
    fn empty_signature_is_absent() {
        assert_eq!(encode("call_abc", Some("")), "call_abc");
    }

    #[test]
    fn splits_on_first_separator() {
        // A signature that itself contains the separator survives intact.
        let sig = format!("prefix{}suffix_padding_to_floor", THOUGHT_SEPARATOR);
        let encoded = encode("call_abc", Some(&sig));
        let (id, decoded) = decode(&encoded);
        assert_eq!(id, "call_abc");
        assert_eq!(decoded, Some(sig));
    }

    #[test]
    fn short_suffix_is_dropped_but_id_recovered() {
        let encoded = format!("call_abc{}tiny", THOUGHT_SEPARATOR);
        let (id, sig) = decode(&encoded);
        assert_eq!(id, "call_abc");
        assert_eq!(sig, None);
    }

    #[test]
    fn detects_encoded_ids() {
        assert!(is_encoded("x__thought__y"));
        assert!(!is_encoded("call_plain"));
    }
}

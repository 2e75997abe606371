//! L3 heuristic screen (§4.5): a JSON string leaf is redacted iff its key
//! name looks suspicious AND its value looks like a high-entropy secret
//! that isn't actually a UUID, ObjectId, URL, timestamp, or email.

use keyhole_common::shannon_entropy;
use keyhole_config::{HeuristicSpec, BUILTIN_HEURISTIC_KEY_NAMES};
use regex::Regex;
use std::sync::OnceLock;

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$").unwrap()
    })
}

fn object_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-fA-F]{24}$").unwrap())
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://").unwrap())
}

fn iso_timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}([T ]\d{2}:\d{2}:\d{2})?").unwrap())
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap())
}

fn key_name_is_suspicious(key: &str, extra: &[String]) -> bool {
    let lower = key.to_ascii_lowercase();
    BUILTIN_HEURISTIC_KEY_NAMES
        .iter()
        .any(|candidate| lower.contains(candidate))
        || extra.iter().any(|candidate| lower.contains(&candidate.to_ascii_lowercase()))
}

fn is_excluded_value(value: &str) -> bool {
    uuid_re().is_match(value)
        || object_id_re().is_match(value)
        || url_re().is_match(value)
        || iso_timestamp_re().is_match(value)
        || email_re().is_match(value)
}

/// Whether `value`, found under JSON key `key`, should be redacted by L3.
pub fn should_redact(key: &str, value: &str, spec: &HeuristicSpec) -> bool {
    if !spec.enabled {
        return false;
    }
    if !key_name_is_suspicious(key, &spec.additional_key_names) {
        return false;
    }
    if value.len() <= spec.min_length as usize {
        return false;
    }
    if is_excluded_value(value) {
        return false;
    }
    shannon_entropy(value) > spec.min_entropy
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> HeuristicSpec {
        HeuristicSpec {
            enabled: true,
            min_length: 16,
            min_entropy: 3.5,
            additional_key_names: vec![],
        }
    }

    #[test]
    fn excludes_uuid_even_under_suspicious_key() {
        assert!(!should_redact(
            "session_id",
            "b3b4a8d2-1e9a-4d2b-8f3a-7c6d5e4f3a2b",
            &spec()
        ));
    }

    #[test]
    fn excludes_email_and_url_and_timestamp() {
        assert!(!should_redact("auth_contact", "person@example.com", &spec()));
        assert!(!should_redact("auth_url", "https://example.com/callback", &spec()));
        assert!(!should_redact("auth_ts", "2024-01-02T03:04:05Z", &spec()));
    }

    #[test]
    fn redacts_high_entropy_value_under_suspicious_key() {
        assert!(should_redact(
            "access_token",
            "f3a9c7e2b6d14a0f9c8b7a6e5d4c3b2a1908f7e6d5c4b3a291807f6e5d4c3b2a",
            &spec()
        ));
    }

    #[test]
    fn ignores_non_suspicious_key() {
        assert!(!should_redact(
            "display_name",
            "f3a9c7e2b6d14a0f9c8b7a6e5d4c3b2a1908f7e6d5c4b3a291807f6e5d4c3b2a",
            &spec()
        ));
    }

    #[test]
    fn respects_additional_key_names() {
        let mut s = spec();
        s.additional_key_names = vec!["widget_code".to_string()];
        assert!(should_redact(
            "widget_code",
            "f3a9c7e2b6d14a0f9c8b7a6e5d4c3b2a1908f7e6d5c4b3a291807f6e5d4c3b2a",
            &s
        ));
    }
}

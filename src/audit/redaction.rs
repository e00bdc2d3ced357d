//! PII redaction for audit metadata
//!
//! Metadata is recursively walked before persistence and a fixed set of
//! field names is redacted. Email and phone receive partial redaction
//! (`***@domain`, `***1234`) so support can triage without seeing the
//! value. No runtime type introspection: the field set is static.

use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashSet;

/// Marker written in place of redacted values.
pub const REDACTION_MARKER: &str = "[REDACTED]";

static REDACTED_FIELDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // Authentication
        "email",
        "phone",
        "phone_number",
        "token",
        "access_token",
        "refresh_token",
        "api_key",
        "api_secret",
        "password",
        "secret",
        "credential",
        "credentials",
        // Personal identifiers
        "ssn",
        "social_security",
        "tax_id",
        "national_id",
        // Financial
        "credit_card",
        "card_number",
        "cvv",
        "bank_account",
        "routing_number",
        // Address components
        "street_address",
        "address_line_1",
        "address_line_2",
    ]
    .into_iter()
    .collect()
});

/// Redacts PII fields from audit metadata before persistence.
pub struct PiiRedactor;

impl PiiRedactor {
    /// Recursively redact PII from a JSON value.
    ///
    /// Returns a new value; the input is not mutated. Non-object inputs
    /// pass through unchanged.
    pub fn redact(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, val) in map {
                    let lower = key.to_lowercase();
                    if REDACTED_FIELDS.contains(lower.as_str()) {
                        out.insert(key.clone(), Self::redact_value(&lower, val));
                    } else {
                        out.insert(key.clone(), Self::redact(val));
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(Self::redact).collect()),
            other => other.clone(),
        }
    }

    /// Redact a single value, partially for email and phone.
    fn redact_value(lower_key: &str, value: &Value) -> Value {
        if value.is_null() {
            return Value::String(REDACTION_MARKER.to_string());
        }
        if lower_key == "email" {
            if let Some(s) = value.as_str() {
                if let Some(domain) = s.split('@').nth(1) {
                    return Value::String(format!("***@{domain}"));
                }
            }
            return Value::String(REDACTION_MARKER.to_string());
        }
        if lower_key == "phone" || lower_key == "phone_number" {
            let s = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if s.len() >= 4 {
                return Value::String(format!("***{}", &s[s.len() - 4..]));
            }
            return Value::String(REDACTION_MARKER.to_string());
        }
        Value::String(REDACTION_MARKER.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_email_partial_redaction() {
        let input = json!({"email": "merchant@store.com"});
        let out = PiiRedactor::redact(&input);
        assert_eq!(out["email"], "***@store.com");
    }

    #[test]
    fn test_phone_partial_redaction() {
        let input = json!({"phone": "+15551234567", "phone_number": "123"});
        let out = PiiRedactor::redact(&input);
        assert_eq!(out["phone"], "***4567");
        assert_eq!(out["phone_number"], REDACTION_MARKER);
    }

    #[test]
    fn test_tokens_fully_redacted() {
        let input = json!({
            "access_token": "shpat_abc123",
            "refresh_token": "r_xyz",
            "api_key": "key",
        });
        let out = PiiRedactor::redact(&input);
        assert_eq!(out["access_token"], REDACTION_MARKER);
        assert_eq!(out["refresh_token"], REDACTION_MARKER);
        assert_eq!(out["api_key"], REDACTION_MARKER);
    }

    #[test]
    fn test_nested_structures_walked() {
        let input = json!({
            "context": {
                "user": {"email": "a@b.co", "name": "A"},
                "cards": [{"card_number": "4111111111111111"}],
            },
            "count": 3,
        });
        let out = PiiRedactor::redact(&input);
        assert_eq!(out["context"]["user"]["email"], "***@b.co");
        assert_eq!(out["context"]["user"]["name"], "A");
        assert_eq!(out["context"]["cards"][0]["card_number"], REDACTION_MARKER);
        assert_eq!(out["count"], 3);
    }

    #[test]
    fn test_key_matching_is_case_insensitive() {
        let input = json!({"Email": "a@b.co", "SSN": "123-45-6789"});
        let out = PiiRedactor::redact(&input);
        assert_eq!(out["Email"], "***@b.co");
        assert_eq!(out["SSN"], REDACTION_MARKER);
    }

    #[test]
    fn test_non_pii_untouched() {
        let input = json!({"shop_domain": "store.myshopify.com", "rows": 42});
        let out = PiiRedactor::redact(&input);
        assert_eq!(out, input);
    }

    #[test]
    fn test_null_pii_value_redacted() {
        let input = json!({"password": null});
        let out = PiiRedactor::redact(&input);
        assert_eq!(out["password"], REDACTION_MARKER);
    }
}

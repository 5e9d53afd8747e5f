//! Credential redaction for log output

use serde_json::Value;

/// Keys whose values never appear in full in a log line
pub const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "consumer_key",
    "consumer_secret",
    "access_token",
    "token",
    "authorization",
    "secret_key",
    "passkey",
];

const PREFIX_LEN: usize = 8;

/// Reduce a secret to a short prefix, e.g. `tDcVSvHk...`
pub fn redact_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let prefix: String = secret.chars().take(PREFIX_LEN).collect();
    format!("{prefix}...")
}

/// Copy of `value` with every sensitive key's string value redacted, at any depth
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let redacted = if is_sensitive(k) {
                        match v {
                            Value::String(s) => Value::String(redact_secret(s)),
                            Value::Null => Value::Null,
                            _ => Value::String("...".to_string()),
                        }
                    } else {
                        redact_json(v)
                    };
                    (k.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        other => other.clone(),
    }
}

fn is_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|k| *k == lower)
}

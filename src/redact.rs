use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

/// Normalized (lower-case, no separators) fragments that mark a key as secret.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "token",
    "apikey",
    "authorization",
    "cookie",
    "session",
    "csrf",
    "xsrf",
    "privatekey",
    "credential",
];

fn normalize(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Short fragments that only count as a whole word ("X-Auth-Token", not "author").
const SENSITIVE_WORDS: &[&str] = &["auth", "oauth", "jwt", "otp"];

/// Split on separators and lower-to-upper case changes: "xAuthToken" -> x, auth, token.
fn words(key: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in key.chars() {
        if !c.is_alphanumeric() {
            prev_lower = false;
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = normalize(key);
    SENSITIVE_KEYS.iter().any(|s| normalized.contains(s))
        || words(key)
            .iter()
            .any(|w| SENSITIVE_WORDS.contains(&w.as_str()))
}

/// Replace the value of every sensitive key, at any depth.
pub fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *inner = Value::String(REDACTED.to_string());
                } else {
                    redact_value(inner);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_value),
        _ => {}
    }
}

/// Redact a recorded command. Typed text aimed at a sensitive field is
/// hidden as well, since its key is just "arguments".
pub fn redact_command(mut record: Value) -> Value {
    let sensitive_target = ["target", "selector", "query"].iter().any(|k| {
        record
            .get(*k)
            .and_then(Value::as_str)
            .is_some_and(mentions_secret)
    });
    if sensitive_target {
        if let Some(args) = record.get_mut("arguments") {
            *args = Value::String(REDACTED.to_string());
        }
    }
    redact_value(&mut record);
    record
}

fn mentions_secret(text: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        .any(is_sensitive_key)
        || is_sensitive_key(text)
}

pub fn redact_trace(records: Vec<Value>) -> Vec<Value> {
    records.into_iter().map(redact_command).collect()
}

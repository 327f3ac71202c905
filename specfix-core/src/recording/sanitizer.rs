use serde_json::Value;
use std::collections::HashMap;

/// Headers that carry credentials and must be redacted.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "private-token",
    "set-cookie",
    "x-gitee-token",
    "x-hub-signature",
    "x-hub-signature-256",
];

/// Query parameters that carry credentials. Gitee-style APIs take the token in the URL.
pub const SENSITIVE_QUERY_PARAMS: &[&str] = &["access_token", "token", "private_token"];

const REDACTED: &str = "[REDACTED]";

pub struct Sanitizer;

impl Sanitizer {
    pub fn is_sensitive_header(header_name: &str) -> bool {
        let lower = header_name.to_lowercase();
        SENSITIVE_HEADERS.contains(&lower.as_str())
    }

    /// Remove sensitive data from headers
    pub fn sanitize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(key, value)| {
                let value = if Self::is_sensitive_header(key) {
                    REDACTED.to_string()
                } else {
                    value.clone()
                };
                (key.clone(), value)
            })
            .collect()
    }

    /// Replace credential query parameters in a URL. Unparseable input is returned as-is.
    pub fn sanitize_url(raw: &str) -> String {
        let Ok(mut parsed) = url::Url::parse(raw) else {
            return raw.to_string();
        };

        if parsed.query().is_none() {
            return raw.to_string();
        }

        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| {
                let v = if SENSITIVE_QUERY_PARAMS.contains(&k.to_lowercase().as_str()) {
                    REDACTED.to_string()
                } else {
                    v.into_owned()
                };
                (k.into_owned(), v)
            })
            .collect();

        parsed.query_pairs_mut().clear().extend_pairs(pairs);
        parsed.to_string()
    }

    /// Remove sensitive data from JSON payloads
    pub fn sanitize_json(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sanitized = serde_json::Map::new();
                for (key, val) in map {
                    let sanitized_val = match key.as_str() {
                        "token" | "access_token" | "api_key" | "secret" | "password" => {
                            Value::String(REDACTED.to_string())
                        }
                        _ => Self::sanitize_json(val),
                    };
                    sanitized.insert(key.clone(), sanitized_val);
                }
                Value::Object(sanitized)
            }
            Value::Array(arr) => Value::Array(arr.iter().map(Self::sanitize_json).collect()),
            _ => value.clone(),
        }
    }
}

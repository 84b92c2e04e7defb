use serde_json::Value;

/// Sanitizes sensitive fields in JSON payloads for logging
pub fn sanitize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sanitized = serde_json::Map::new();
            for (key, val) in map {
                let sanitized_val = if is_sensitive_field(key) {
                    mask_value(val)
                } else {
                    sanitize_json(val)
                };
                sanitized.insert(key.clone(), sanitized_val);
            }
            Value::Object(sanitized)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sanitize_json).collect()),
        _ => value.clone(),
    }
}

/// Webhook bodies are JSON (Payme, Uzum) or form-encoded (Click).
pub fn sanitize_body(bytes: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<Value>(bytes) {
        return serde_json::to_string(&sanitize_json(&json))
            .unwrap_or_else(|_| "[invalid json]".to_string());
    }

    let Ok(text) = std::str::from_utf8(bytes) else {
        return format!("[binary, {} bytes]", bytes.len());
    };
    if !text.contains('=') {
        return format!("[non-json, {} bytes]", bytes.len());
    }

    url::form_urlencoded::parse(text.as_bytes())
        .map(|(key, value)| {
            let shown = if is_sensitive_field(&key) {
                mask_str(&value)
            } else {
                value.into_owned()
            };
            format!("{}={}", key, shown)
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn is_sensitive_field(key: &str) -> bool {
    matches!(
        key.to_lowercase().as_str(),
        "password" | "secret" | "token" | "api_key" | "authorization" | "sign_string" | "card_number"
    )
}

fn mask_str(s: &str) -> String {
    if s.len() > 8 && s.is_char_boundary(4) && s.is_char_boundary(s.len() - 4) {
        format!("{}****{}", &s[..4], &s[s.len() - 4..])
    } else {
        "****".to_string()
    }
}

fn mask_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(mask_str(s)),
        _ => Value::String("****".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_nested() {
        let input = json!({
            "params": {
                "password": "payme-merchant-key-1",
                "amount": 150000
            }
        });

        let sanitized = sanitize_json(&input);
        assert_eq!(sanitized["params"]["password"], "paym****ey-1");
        assert_eq!(sanitized["params"]["amount"], 150000);
    }

    #[test]
    fn test_sanitize_form_body() {
        let body = b"click_trans_id=5001&sign_string=0123456789abcdef&amount=10000";
        let sanitized = sanitize_body(body);
        assert_eq!(sanitized, "click_trans_id=5001&sign_string=0123****cdef&amount=10000");
    }

    #[test]
    fn test_short_secret_fully_masked() {
        assert_eq!(mask_str("abc"), "****");
    }
}

//! Normalization of raw `tools/call` results into one JSON value.

use serde_json::{Map, Value, json};

/// Flatten an MCP result.
///
/// Text-only results become the parsed JSON of their text (or the raw text
/// when it is not JSON). Results with image parts become
/// `{"text"?: ..., "images": [{"data", "mimeType"}]}`. A result flagged
/// `isError` becomes `Err` carrying its text.
pub fn normalize_result(raw: Value) -> Result<Value, String> {
    let is_error = raw.get("isError").and_then(Value::as_bool).unwrap_or(false);

    let Some(parts) = raw.get("content").and_then(Value::as_array) else {
        // Not content-shaped; structured results pass through
        if is_error {
            return Err(raw.to_string());
        }
        return Ok(raw.get("structuredContent").cloned().unwrap_or(raw));
    };

    let mut texts = Vec::new();
    let mut images = Vec::new();
    for part in parts {
        match part.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    texts.push(text);
                }
            }
            Some("image") => images.push(json!({
                "data": part.get("data").cloned().unwrap_or(Value::Null),
                "mimeType": part.get("mimeType").cloned().unwrap_or(Value::Null),
            })),
            _ => {}
        }
    }
    let text = texts.join("\n");

    if is_error {
        return Err(if text.is_empty() {
            "tool reported an error".to_string()
        } else {
            text
        });
    }

    if images.is_empty() {
        return Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)));
    }

    let mut envelope = Map::new();
    if !text.is_empty() {
        envelope.insert("text".into(), Value::String(text));
    }
    envelope.insert("images".into(), Value::Array(images));
    Ok(Value::Object(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_json_is_parsed() {
        let raw = json!({"content": [{"type": "text", "text": "{\"answer\": 4}"}]});
        assert_eq!(normalize_result(raw).unwrap(), json!({"answer": 4}));
    }

    #[test]
    fn test_plain_text_falls_back_to_string() {
        let raw = json!({"content": [{"type": "text", "text": "four"}]});
        assert_eq!(normalize_result(raw).unwrap(), json!("four"));
    }

    #[test]
    fn test_images_produce_envelope() {
        let raw = json!({"content": [
            {"type": "text", "text": "chart"},
            {"type": "image", "data": "iVBOR", "mimeType": "image/png"}
        ]});
        assert_eq!(
            normalize_result(raw).unwrap(),
            json!({"text": "chart", "images": [{"data": "iVBOR", "mimeType": "image/png"}]})
        );
    }

    #[test]
    fn test_image_only_omits_text() {
        let raw = json!({"content": [{"type": "image", "data": "x", "mimeType": "image/jpeg"}]});
        let v = normalize_result(raw).unwrap();
        assert!(v.get("text").is_none());
        assert_eq!(v["images"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_is_error_becomes_err() {
        let raw = json!({"isError": true, "content": [{"type": "text", "text": "rate limited"}]});
        assert_eq!(normalize_result(raw).unwrap_err(), "rate limited");
    }
}

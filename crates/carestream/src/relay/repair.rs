//! Per-type payload repair rules
//!
//! The backend occasionally emits events with missing or malformed fields.
//! Rather than surface those to the browser, the relay patches known event
//! types with placeholder content before forwarding. Repairs only run on
//! successfully parsed JSON payloads; anything with an unknown `type` passes
//! through untouched.

use serde_json::{Value, json};

/// Placeholder markdown injected when a completion event arrives without
/// its reasoning body.
const REASONING_PLACEHOLDER: &str =
    "**AI Reasoning**\n\nGenerating clinical reasoning for this section...";

/// Apply type-specific repair rules to a parsed event payload.
///
/// Returns `None` when the event should be dropped entirely (currently only
/// reasoning chunks with blank content), otherwise the possibly-modified
/// payload. Applying the rules to an already-repaired payload is a no-op.
pub fn repair_event(mut event: Value) -> Option<Value> {
    match event.get("type").and_then(Value::as_str) {
        Some("section_reasoning_chunk") => {
            let blank = event
                .get("content")
                .and_then(Value::as_str)
                .is_none_or(|content| content.trim().is_empty());
            if blank {
                return None;
            }
        }
        Some("section_reasoning_complete") => {
            if is_falsy(event.get("full_reasoning_markdown")) {
                tracing::warn!(
                    "missing full_reasoning_markdown in section_reasoning_complete event, \
                     injecting placeholder"
                );
                event["full_reasoning_markdown"] = json!(REASONING_PLACEHOLDER);
            }
        }
        Some("sources_data") => {
            if !event.get("data").is_some_and(Value::is_array) {
                tracing::warn!("missing or invalid sources_data, injecting placeholder");
                event["data"] = json!([{
                    "title": "No citations available",
                    "url": "#",
                    "snippet": "Citations data could not be retrieved from the AI."
                }]);
            }
        }
        _ => {}
    }

    Some(event)
}

/// Build the error event substituted for a payload that failed JSON parsing.
pub fn parse_failure_event(error: &str, raw_payload: &str) -> Value {
    section_error(format!("Failed to parse event: {error} (payload: {raw_payload})"))
}

/// Build the error event emitted when the relay itself fails mid-stream.
pub fn relay_failure_event(message: &str) -> Value {
    section_error(message.to_string())
}

fn section_error(content: String) -> Value {
    json!({
        "type": "section_error",
        "section_id": "streaming",
        "display_name": "Streaming Process",
        "content": content,
    })
}

// Mirrors the truthiness the backend's consumers rely on: absent, null,
// empty string, false, and zero all count as missing.
fn is_falsy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => !b,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(_) => false,
    }
}

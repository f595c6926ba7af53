//! Diagnostic transcripts for responses that never became an event stream.
//!
//! A failed or unexpected response still finishes the session normally: its
//! body is rendered as readable text and becomes the final transcript.

use serde_json::Value;

use crate::config::RelayConfig;

const JSON_FENCE: &str = "```json";

/// Render a response body for humans.
///
/// JSON bodies are pretty-printed and fenced as a `json` code block. An empty
/// object falls back to the raw text, and text that is already fenced is kept
/// as is.
pub fn pretty_object(raw: &str) -> String {
    let rendered = match serde_json::from_str::<Value>(raw) {
        Ok(Value::String(s)) => s,
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string()),
        Err(_) => return raw.to_string(),
    };
    if rendered == "{}" {
        return raw.to_string();
    }
    if rendered.starts_with(JSON_FENCE) {
        return rendered;
    }
    format!("{JSON_FENCE}\n{rendered}\n```")
}

/// Assemble the transcript reported for a non-stream response.
///
/// Parts are joined by a paragraph break: the unauthorized notice for a 401,
/// then the rendered body. The result goes through overload normalization.
pub fn diagnostic_transcript(status: u16, body: &str, config: &RelayConfig) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(2);
    if status == 401 && !config.locale.unauthorized.is_empty() {
        parts.push(config.locale.unauthorized.clone());
    }
    let extra = pretty_object(body);
    if !extra.is_empty() {
        parts.push(extra);
    }
    config.normalize_overload(parts.join("\n\n"))
}

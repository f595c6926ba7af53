//! Shared data types: fragments, tool calls, tool messages and response metadata.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One parsed increment of model output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fragment {
    /// Text carried by the increment.
    pub content: String,
    /// `None` means the parser did not classify the text; the assembler
    /// infers it from inline think tags or the previous fragment.
    pub is_thinking: Option<bool>,
}

impl Fragment {
    /// Unclassified text fragment.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_thinking: None,
        }
    }

    /// Fragment explicitly marked as reasoning.
    pub fn thinking(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_thinking: Some(true),
        }
    }

    /// Fragment explicitly marked as final-answer text.
    pub fn answer(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_thinking: Some(false),
        }
    }
}

/// Function name and raw argument text of a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON text, possibly accumulated over several stream deltas.
    #[serde(default)]
    pub arguments: String,
}

/// A tool invocation requested by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_type")]
    pub r#type: String,
    pub function: FunctionCall,
    /// Position in the streamed `tool_calls` array, used while accumulating deltas.
    /// Never sent back to the backend.
    #[serde(skip)]
    pub index: Option<usize>,
}

fn default_tool_type() -> String {
    "function".to_string()
}

impl ToolCall {
    /// Build a function tool call.
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            r#type: default_tool_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
            index: None,
        }
    }

    /// Parse the accumulated argument text. Absent arguments yield an empty object.
    pub fn parsed_arguments(&self) -> Result<Value, serde_json::Error> {
        if self.function.arguments.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.function.arguments)
    }
}

/// Assistant message carrying one round's full tool-call batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallMessage {
    pub role: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ToolCallMessage {
    pub fn new(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            tool_calls,
        }
    }
}

/// Tool-role message folded into the conversation after a tool round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub name: String,
    pub role: String,
    pub content: String,
    pub tool_call_id: String,
    /// Not sent to the backend; lets extenders and tests tell failures apart.
    #[serde(skip)]
    pub is_error: bool,
}

impl ToolResultMessage {
    pub fn new(call: &ToolCall, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            name: call.function.name.clone(),
            role: "tool".to_string(),
            content: content.into(),
            tool_call_id: call.id.clone(),
            is_error,
        }
    }
}

/// Reported to `on_after_tool` once a single invocation has settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResultEvent {
    pub call: ToolCall,
    /// Success payload; `None` when the call failed.
    pub content: Option<String>,
    pub is_error: bool,
    /// Normalized error text when the call failed.
    pub error_msg: Option<String>,
}

/// Status and headers of the response that opened a transport cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseMeta {
    pub status: u16,
    /// Header names are stored lowercase.
    pub headers: HashMap<String, String>,
}

impl ResponseMeta {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `text/plain` bodies are complete answers delivered without streaming.
    pub fn is_plain_text(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.starts_with("text/plain"))
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.starts_with(EVENT_STREAM_CONTENT_TYPE))
    }
}

/// Content type announced by server-sent event responses.
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_arguments_parse_to_empty_object() {
        let call = ToolCall::function("c1", "lookup", "");
        assert_eq!(call.parsed_arguments().unwrap(), serde_json::json!({}));
    }

    #[test]
    fn tool_result_message_serializes_without_error_flag() {
        let call = ToolCall::function("c1", "lookup", "{}");
        let msg = ToolResultMessage::new(&call, "ok", true);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "name": "lookup",
                "role": "tool",
                "content": "ok",
                "tool_call_id": "c1"
            })
        );
    }

    #[test]
    fn tool_call_serializes_in_openai_shape() {
        let call = ToolCall::function("c1", "lookup", "{\"q\":1}");
        let v = serde_json::to_value(ToolCallMessage::new(vec![call])).unwrap();
        assert_eq!(v["role"], "assistant");
        assert_eq!(v["tool_calls"][0]["type"], "function");
        assert_eq!(v["tool_calls"][0]["function"]["arguments"], "{\"q\":1}");
        assert!(v["tool_calls"][0].get("index").is_none());
    }

    #[test]
    fn streamed_index_stays_out_of_the_request() {
        let mut call = ToolCall::function("c2", "lookup", "{}");
        call.index = Some(3);
        let v = serde_json::to_value(&call).unwrap();
        assert!(v.get("index").is_none());
        assert_eq!(v["id"], "c2");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let meta = ResponseMeta::new(200)
            .with_header("Content-Type", "text/event-stream; charset=utf-8");
        assert!(meta.is_event_stream());
        assert!(!meta.is_plain_text());
        assert_eq!(meta.header("CONTENT-TYPE"), meta.content_type());
    }
}

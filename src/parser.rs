//! Chunk parsers
//!
//! A [`ChunkParser`] turns one raw event payload into at most one
//! [`Fragment`] and may grow the pending tool-call list while doing so. The
//! wire format of individual events is entirely the parser's concern; the
//! session only guards the call.

use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;
use crate::types::{Fragment, FunctionCall, ToolCall};

/// Converts raw event text into fragments.
pub trait ChunkParser: Send + Sync {
    /// Parse a single event payload.
    ///
    /// `pending` holds tool calls accumulated so far in this transport cycle;
    /// parsers append new calls and extend argument text of existing ones.
    fn parse(&self, raw: &str, pending: &mut Vec<ToolCall>) -> Result<Option<Fragment>>;
}

impl<F> ChunkParser for F
where
    F: Fn(&str, &mut Vec<ToolCall>) -> Result<Option<Fragment>> + Send + Sync,
{
    fn parse(&self, raw: &str, pending: &mut Vec<ToolCall>) -> Result<Option<Fragment>> {
        self(raw, pending)
    }
}

#[derive(Debug, Deserialize)]
struct ChunkEvent {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

/// Parser for OpenAI-compatible `chat.completion.chunk` events.
///
/// Reasoning text (`reasoning_content`, `thinking`, `reasoning`, in that
/// priority) becomes a thinking fragment. Answer text is left unclassified
/// so inline `<think>` tags can still be recognized downstream.
#[derive(Debug, Clone, Default)]
pub struct OpenAiChunkParser;

impl OpenAiChunkParser {
    pub fn new() -> Self {
        Self
    }

    fn extract_thinking(delta: &Value) -> Option<String> {
        ["reasoning_content", "thinking", "reasoning"]
            .iter()
            .find_map(|field| {
                delta
                    .get(field)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
    }

    fn accumulate_tool_calls(delta: &Value, pending: &mut Vec<ToolCall>) -> Result<()> {
        let Some(raw_calls) = delta.get("tool_calls") else {
            return Ok(());
        };
        if raw_calls.is_null() {
            return Ok(());
        }
        let calls: Vec<ToolCallDelta> = serde_json::from_value(raw_calls.clone())?;
        for call in calls {
            let arguments = call
                .function
                .as_ref()
                .and_then(|f| f.arguments.clone())
                .unwrap_or_default();
            match call.id.filter(|id| !id.is_empty()) {
                Some(id) => pending.push(ToolCall {
                    id,
                    r#type: call.kind.unwrap_or_else(|| "function".to_string()),
                    function: FunctionCall {
                        name: call
                            .function
                            .and_then(|f| f.name)
                            .unwrap_or_default(),
                        arguments,
                    },
                    index: call.index,
                }),
                None => {
                    // Continuation deltas carry only the index and an argument slice.
                    let target = match call.index {
                        Some(idx) => pending.iter_mut().rev().find(|c| c.index == Some(idx)),
                        None => pending.last_mut(),
                    };
                    match target {
                        Some(existing) => existing.function.arguments.push_str(&arguments),
                        None => tracing::debug!(
                            "dropping tool-call delta without a known call: index={:?}",
                            call.index
                        ),
                    }
                }
            }
        }
        Ok(())
    }
}

impl ChunkParser for OpenAiChunkParser {
    fn parse(&self, raw: &str, pending: &mut Vec<ToolCall>) -> Result<Option<Fragment>> {
        let event: ChunkEvent = serde_json::from_str(raw)?;
        let Some(delta) = event.choices.into_iter().next().and_then(|c| c.delta) else {
            return Ok(None);
        };

        Self::accumulate_tool_calls(&delta, pending)?;

        if let Some(thinking) = Self::extract_thinking(&delta) {
            return Ok(Some(Fragment::thinking(thinking)));
        }
        let content = delta
            .get("content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        Ok(content.map(Fragment::text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;

    #[test]
    fn content_delta_becomes_unclassified_fragment() {
        let mut pending = Vec::new();
        let f = OpenAiChunkParser
            .parse(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#, &mut pending)
            .unwrap();
        assert_eq!(f, Some(Fragment::text("Hi")));
        assert!(pending.is_empty());
    }

    #[test]
    fn reasoning_content_takes_priority() {
        let mut pending = Vec::new();
        let f = OpenAiChunkParser
            .parse(
                r#"{"choices":[{"delta":{"content":null,"reasoning_content":"hmm","reasoning":"x"}}]}"#,
                &mut pending,
            )
            .unwrap();
        assert_eq!(f, Some(Fragment::thinking("hmm")));
    }

    #[test]
    fn tool_call_arguments_accumulate_across_deltas() {
        let parser = OpenAiChunkParser::new();
        let mut pending = Vec::new();
        let events = [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","type":"function","function":{"name":"weather","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"city\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"time","arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Oslo\"}"}}]}}]}"#,
        ];
        for e in events {
            assert_eq!(parser.parse(e, &mut pending).unwrap(), None);
        }
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, "call_a");
        assert_eq!(pending[0].function.arguments, r#"{"city":"Oslo"}"#);
        assert_eq!(pending[1].function.name, "time");
        assert_eq!(
            pending[0].parsed_arguments().unwrap(),
            serde_json::json!({"city": "Oslo"})
        );
    }

    #[test]
    fn malformed_payload_is_a_parse_error() {
        let mut pending = Vec::new();
        let err = OpenAiChunkParser.parse("{not json", &mut pending).unwrap_err();
        assert!(matches!(err, RelayError::ParseError(_)));
    }

    #[test]
    fn closures_are_parsers() {
        let parser = |raw: &str, _: &mut Vec<ToolCall>| -> Result<Option<Fragment>> {
            Ok(Some(Fragment::text(raw.to_uppercase())))
        };
        let mut pending = Vec::new();
        assert_eq!(
            parser.parse("abc", &mut pending).unwrap(),
            Some(Fragment::text("ABC"))
        );
    }
}

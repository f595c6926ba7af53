//! Conversation extension between tool rounds.
//!
//! The request payload is owned by the session and only touched here, after a
//! round's results are in and before the next request goes out.

use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::types::{ToolCallMessage, ToolResultMessage};

/// Folds one tool round into the request payload.
pub trait ConversationExtender: Send + Sync {
    fn extend(
        &self,
        payload: &mut Value,
        call_message: &ToolCallMessage,
        results: &[ToolResultMessage],
    ) -> Result<()>;
}

impl<F> ConversationExtender for F
where
    F: Fn(&mut Value, &ToolCallMessage, &[ToolResultMessage]) -> Result<()> + Send + Sync,
{
    fn extend(
        &self,
        payload: &mut Value,
        call_message: &ToolCallMessage,
        results: &[ToolResultMessage],
    ) -> Result<()> {
        self(payload, call_message, results)
    }
}

/// Appends to the `messages` array of an OpenAI-style chat payload.
#[derive(Debug, Clone, Default)]
pub struct OpenAiMessagesExtender;

impl ConversationExtender for OpenAiMessagesExtender {
    fn extend(
        &self,
        payload: &mut Value,
        call_message: &ToolCallMessage,
        results: &[ToolResultMessage],
    ) -> Result<()> {
        let Some(obj) = payload.as_object_mut() else {
            return Err(RelayError::InternalError(
                "conversation payload must be a JSON object".into(),
            ));
        };
        let messages = obj
            .entry("messages")
            .or_insert_with(|| Value::Array(Vec::new()));
        let Some(messages) = messages.as_array_mut() else {
            return Err(RelayError::InternalError(
                "conversation payload `messages` must be an array".into(),
            ));
        };
        messages.push(serde_json::to_value(call_message)?);
        for result in results {
            messages.push(serde_json::to_value(result)?);
        }
        Ok(())
    }
}

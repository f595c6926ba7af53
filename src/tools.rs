//! Tool handlers and the tool-round coordinator.
//!
//! A round invokes every pending call concurrently, waits for all of them, and
//! returns the results in the order the calls were requested. Handler failures
//! never escape a round: they become error-tagged tool results.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, join_all};
use serde_json::Value;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::types::{ToolCall, ToolResultEvent, ToolResultMessage};

/// What a tool handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// A bare value, reported as success.
    Value(Value),
    /// An HTTP-like response; a status of 300 or above is a failure.
    Response {
        data: Option<Value>,
        status: u16,
        status_text: Option<String>,
    },
}

impl ToolOutput {
    pub fn ok(data: impl Into<Value>) -> Self {
        ToolOutput::Response {
            data: Some(data.into()),
            status: 200,
            status_text: None,
        }
    }

    pub fn status(status: u16, data: Option<Value>, status_text: Option<String>) -> Self {
        ToolOutput::Response {
            data,
            status,
            status_text,
        }
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        ToolOutput::Value(value)
    }
}

/// A local function the backend may ask to run.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<ToolOutput>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
{
    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        (self.0)(arguments).await
    }
}

struct RegisteredTool {
    handler: Arc<dyn ToolHandler>,
    schema: Option<Value>,
}

/// Function name to handler mapping.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<RegisteredTool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
    ) -> &mut Self {
        self.tools.insert(
            name.into(),
            Arc::new(RegisteredTool {
                handler,
                schema: None,
            }),
        );
        self
    }

    /// Register a handler whose arguments are validated against a JSON schema
    /// before it runs.
    pub fn register_with_schema(
        &mut self,
        name: impl Into<String>,
        schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> &mut Self {
        self.tools.insert(
            name.into(),
            Arc::new(RegisteredTool {
                handler,
                schema: Some(schema),
            }),
        );
        self
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(f)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run one call end to end. The returned future owns everything it needs.
    fn invoke(&self, call: &ToolCall) -> BoxFuture<'static, Result<ToolOutput>> {
        let name = call.function.name.clone();
        let Some(tool) = self.tools.get(&name).cloned() else {
            return Box::pin(async move { Err(RelayError::ToolNotFound(name)) });
        };
        let arguments = call.parsed_arguments();
        Box::pin(async move {
            let arguments =
                arguments.map_err(|e| RelayError::InvalidToolArguments(e.to_string()))?;
            if let Some(schema) = &tool.schema {
                validate_args_with_schema(schema, &arguments)
                    .map_err(RelayError::InvalidToolArguments)?;
            }
            tool.handler.call(arguments).await
        })
    }
}

fn validate_args_with_schema(schema: &Value, instance: &Value) -> std::result::Result<(), String> {
    if !schema.is_object() {
        return Ok(());
    }
    match jsonschema::validator_for(schema) {
        Ok(validator) => {
            let msgs: Vec<String> = validator
                .iter_errors(instance)
                .take(3)
                .map(|err| err.to_string())
                .collect();
            if msgs.is_empty() {
                Ok(())
            } else {
                Err(format!(
                    "Tool arguments failed schema validation: {}",
                    msgs.join("; ")
                ))
            }
        }
        Err(e) => {
            tracing::warn!("invalid tool schema: {}", e);
            Ok(())
        }
    }
}

/// Hooks invoked around each call of a round.
pub type BeforeToolFn = Arc<dyn Fn(&ToolCall) + Send + Sync>;
pub type AfterToolFn = Arc<dyn Fn(&ToolResultEvent) + Send + Sync>;

/// Run one tool round over an already-snapshotted batch of calls.
///
/// Calls run concurrently; the returned messages follow `calls` order.
pub async fn run_tool_round(
    registry: &ToolRegistry,
    calls: &[ToolCall],
    config: &RelayConfig,
    on_before: Option<BeforeToolFn>,
    on_after: Option<AfterToolFn>,
) -> Vec<ToolResultMessage> {
    let invocations = calls.iter().map(|call| {
        if let Some(cb) = &on_before {
            cb(call);
        }
        let fut = registry.invoke(call);
        let on_after = on_after.clone();
        async move {
            let outcome = fut.await.and_then(|output| success_content(output, config));
            let (content, is_error) = match outcome {
                Ok(content) => (content, false),
                Err(err) => {
                    tracing::warn!(
                        tool = %call.function.name,
                        id = %call.id,
                        "tool call failed: {}",
                        err
                    );
                    (config.normalize_overload(err.to_string()), true)
                }
            };
            if let Some(cb) = &on_after {
                cb(&ToolResultEvent {
                    call: call.clone(),
                    content: (!is_error).then(|| content.clone()),
                    is_error,
                    error_msg: is_error.then(|| content.clone()),
                });
            }
            ToolResultMessage::new(call, content, is_error)
        }
    });
    join_all(invocations).await
}

/// Normalize handler output into message content; statuses >= 300 fail.
fn success_content(output: ToolOutput, config: &RelayConfig) -> Result<String> {
    match output {
        ToolOutput::Value(value) => Ok(config.normalize_overload(stringify(value))),
        ToolOutput::Response {
            data,
            status,
            status_text,
        } => {
            let payload = data
                .filter(is_truthy)
                .or_else(|| status_text.map(Value::String));
            let content = config.normalize_overload(payload.map(stringify).unwrap_or_default());
            if status >= 300 {
                Err(RelayError::ToolError(content))
            } else {
                Ok(content)
            }
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

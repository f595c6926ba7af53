//! # Siumai Relay
//!
//! Client-side relay for streamed chat completions. A [`Session`] consumes an
//! event-stream response, reveals the received text to the consumer at a
//! steady pace, renders reasoning as a quoted block ahead of the answer, and
//! runs tool-call rounds: when the backend asks for tools, the relay invokes
//! the registered handlers, folds their results into the conversation and
//! requests a continuation.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use siumai_relay::prelude::*;
//!
//! let mut tools = ToolRegistry::new();
//! tools.register_fn("get_time", |_args| async { Ok(ToolOutput::ok("12:00")) });
//!
//! let session = Session::builder(Arc::new(HttpTransport::new()))
//!     .config(RelayConfig::builder().thinking(ThinkingStrategy::ThinkingAware).build()?)
//!     .tools(tools)
//!     .callbacks(StreamCallbacks::new().with_update(|_shown, delta| print!("{delta}")))
//!     .build()?;
//!
//! let request = TransportRequest::post(
//!     "https://api.openai.com/v1/chat/completions",
//!     serde_json::json!({"model": "gpt-4o-mini", "stream": true, "messages": []}),
//! )
//! .with_header("Authorization", format!("Bearer {key}"));
//!
//! let outcome = session.start(request).join().await?;
//! println!("\n{} tool rounds", outcome.tool_rounds);
//! ```
//!
//! ## Features
//!
//! - `telemetry` (default) - tracing subscriber setup with `tracing-subscriber`

#![deny(unsafe_code)]

pub mod assembler;
pub mod cancel;
pub mod config;
pub mod conversation;
pub mod diagnostics;
pub mod error;
pub mod pacing;
pub mod parser;
pub mod session;
pub mod tools;
pub mod transport;
pub mod types;

/// Telemetry and tracing utilities
#[cfg(feature = "telemetry")]
pub mod telemetry;

pub use cancel::CancelHandle;
pub use config::{LocaleStrings, RelayConfig, RelayConfigBuilder, ThinkingStrategy};
pub use error::{RelayError, Result};
pub use session::{
    Session, SessionBuilder, SessionEvent, SessionOutcome, SessionState, StreamCallbacks,
    StreamHandle,
};

/// Commonly used types.
pub mod prelude {
    pub use crate::cancel::CancelHandle;
    pub use crate::config::{RelayConfig, ThinkingStrategy};
    pub use crate::conversation::{ConversationExtender, OpenAiMessagesExtender};
    pub use crate::error::{RelayError, Result};
    pub use crate::parser::{ChunkParser, OpenAiChunkParser};
    pub use crate::session::{
        Session, SessionEvent, SessionOutcome, StreamCallbacks, StreamHandle,
    };
    pub use crate::tools::{ToolHandler, ToolOutput, ToolRegistry};
    pub use crate::transport::{EventTransport, HttpTransport, TransportRequest, TransportResponse};
    pub use crate::types::{Fragment, ResponseMeta, ToolCall, ToolResultEvent};
}

//! Shared test support: a scripted in-memory transport, SSE fixtures and a
//! callback recorder.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use siumai_relay::cancel::CancelHandle;
use siumai_relay::config::RelayConfig;
use siumai_relay::error::{RelayError, Result};
use siumai_relay::session::{Session, SessionEvent, StreamCallbacks};
use siumai_relay::tools::ToolRegistry;
use siumai_relay::transport::{EventTransport, TransportRequest, TransportResponse};
use siumai_relay::types::{ResponseMeta, ToolCall, ToolResultEvent};
use tokio::sync::Notify;

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Load an `.sse` fixture file.
pub fn fixture(name: &str) -> String {
    std::fs::read_to_string(fixtures_dir().join(name)).expect("read fixture text")
}

/// Split raw SSE text into frames, each terminated by a blank line.
pub fn sse_frames(raw: &str) -> Vec<String> {
    raw.replace("\r\n", "\n")
        .split("\n\n")
        .map(|frame| frame.trim_end_matches('\n'))
        .filter(|frame| !frame.is_empty())
        .map(|frame| format!("{frame}\n\n"))
        .collect()
}

/// A `chat.completion.chunk` frame carrying answer text.
pub fn content_event(text: &str) -> String {
    json!({"choices": [{"index": 0, "delta": {"content": text}}]}).to_string()
}

/// What the scripted transport answers to the next request.
pub enum Reply {
    Sse { frames: Vec<String>, delay: Duration },
    Body {
        status: u16,
        content_type: String,
        body: String,
    },
    Fail(RelayError),
    /// Never opens; resolves only on cancellation.
    Hang,
}

impl Reply {
    pub fn sse(raw: &str) -> Self {
        Reply::Sse {
            frames: sse_frames(raw),
            delay: Duration::ZERO,
        }
    }

    pub fn events(payloads: &[String]) -> Self {
        Reply::Sse {
            frames: payloads.iter().map(|p| format!("data: {p}\n\n")).collect(),
            delay: Duration::ZERO,
        }
    }

    /// Like [`Reply::events`], pausing before every frame.
    pub fn slow_events(payloads: &[String], delay: Duration) -> Self {
        Reply::Sse {
            frames: payloads.iter().map(|p| format!("data: {p}\n\n")).collect(),
            delay,
        }
    }

    pub fn plain(body: &str) -> Self {
        Reply::Body {
            status: 200,
            content_type: "text/plain; charset=utf-8".into(),
            body: body.into(),
        }
    }

    pub fn status(status: u16, content_type: &str, body: &str) -> Self {
        Reply::Body {
            status,
            content_type: content_type.into(),
            body: body.into(),
        }
    }
}

/// Transport that replays scripted replies and records every payload sent.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<Value>>,
}

impl ScriptedTransport {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventTransport for ScriptedTransport {
    async fn open(
        &self,
        request: &TransportRequest,
        cancel: &CancelHandle,
    ) -> Result<TransportResponse> {
        self.requests.lock().unwrap().push(request.payload());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            None => Err(RelayError::HttpError("no scripted reply left".into())),
            Some(Reply::Fail(error)) => Err(error),
            Some(Reply::Hang) => {
                cancel.cancelled().await;
                Err(RelayError::StreamError("cancelled".into()))
            }
            Some(Reply::Body {
                status,
                content_type,
                body,
            }) => Ok(TransportResponse::from_text(
                ResponseMeta::new(status).with_header("content-type", content_type),
                body,
            )),
            Some(Reply::Sse { frames, delay }) => {
                let meta =
                    ResponseMeta::new(200).with_header("content-type", "text/event-stream");
                if delay.is_zero() {
                    return Ok(TransportResponse::from_chunks(meta, frames));
                }
                let body = futures_util::stream::iter(frames).then(move |frame| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, RelayError>(frame.into_bytes())
                });
                Ok(TransportResponse::new(meta, Box::pin(body)))
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Recorded {
    pub updates: Vec<(String, String)>,
    pub finishes: Vec<(String, Option<ResponseMeta>)>,
    pub errors: Vec<RelayError>,
    pub before: Vec<ToolCall>,
    pub after: Vec<ToolResultEvent>,
    pub events: Vec<SessionEvent>,
}

impl Recorded {
    /// Concatenation of every revealed delta.
    pub fn revealed(&self) -> String {
        self.updates.iter().map(|(_, delta)| delta.as_str()).collect()
    }

    pub fn reports(&self) -> usize {
        self.finishes.len() + self.errors.len()
    }
}

/// Captures every callback invocation.
#[derive(Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<Recorded>>,
    fragment_seen: Arc<Notify>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> StreamCallbacks {
        let updates = self.inner.clone();
        let finishes = self.inner.clone();
        let errors = self.inner.clone();
        let before = self.inner.clone();
        let after = self.inner.clone();
        let events = self.inner.clone();
        let fragment_seen = self.fragment_seen.clone();
        StreamCallbacks::new()
            .with_update(move |shown, delta| {
                updates
                    .lock()
                    .unwrap()
                    .updates
                    .push((shown.to_string(), delta.to_string()))
            })
            .with_finish(move |transcript, meta| {
                finishes
                    .lock()
                    .unwrap()
                    .finishes
                    .push((transcript.to_string(), meta.cloned()))
            })
            .with_error(move |e| errors.lock().unwrap().errors.push(e.clone()))
            .with_before_tool(move |call| before.lock().unwrap().before.push(call.clone()))
            .with_after_tool(move |ev| after.lock().unwrap().after.push(ev.clone()))
            .with_event(move |ev| {
                if matches!(ev, SessionEvent::Fragment { .. }) {
                    fragment_seen.notify_one();
                }
                events.lock().unwrap().events.push(ev.clone())
            })
    }

    /// Resolves once some text entered the reveal buffer.
    pub async fn first_fragment(&self) {
        self.fragment_seen.notified().await
    }

    pub fn snapshot(&self) -> Recorded {
        self.inner.lock().unwrap().clone()
    }
}

pub fn chat_request() -> TransportRequest {
    TransportRequest::post(
        "http://relay.test/v1/chat/completions",
        json!({
            "model": "test-model",
            "stream": true,
            "messages": [{"role": "user", "content": "What's the weather in Oslo?"}]
        }),
    )
}

pub fn build_session(
    transport: Arc<ScriptedTransport>,
    config: RelayConfig,
    tools: ToolRegistry,
    recorder: &Recorder,
) -> Session {
    Session::builder(transport)
        .config(config)
        .tools(tools)
        .callbacks(recorder.callbacks())
        .build()
        .expect("valid session config")
}

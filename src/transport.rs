//! Event transport
//!
//! The transport opens one request per cycle and hands back the response
//! metadata plus the raw body. The session decides from the metadata whether
//! the body is read whole (plain answers, diagnostics) or decoded as
//! server-sent events.

use std::collections::HashMap;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde_json::Value;

use crate::cancel::CancelHandle;
use crate::error::{RelayError, Result};
use crate::types::ResponseMeta;

/// Raw body chunks as they arrive from the network.
pub type BodyStream = BoxStream<'static, Result<Vec<u8>>>;

/// Decoded event payloads (the `data` field of each server-sent event).
pub type EventStream = BoxStream<'static, Result<String>>;

/// One request of a session. The body grows between tool rounds.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub url: String,
    pub method: String,
    /// Conversation payload, without the tool definitions.
    pub body: Value,
    pub headers: HashMap<String, String>,
    /// Tool definitions offered to the backend.
    pub tools: Vec<Value>,
}

impl TransportRequest {
    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            body,
            headers: HashMap::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    /// The JSON body actually sent: `body` with `tools` merged in when any
    /// are defined.
    pub fn payload(&self) -> Value {
        let mut payload = self.body.clone();
        if !self.tools.is_empty() {
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("tools".to_string(), Value::Array(self.tools.clone()));
            }
        }
        payload
    }
}

/// An opened response.
pub struct TransportResponse {
    pub meta: ResponseMeta,
    body: BodyStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    pub fn new(meta: ResponseMeta, body: BodyStream) -> Self {
        Self { meta, body }
    }

    /// A response whose body arrives as the given chunks.
    pub fn from_chunks<I, C>(meta: ResponseMeta, chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        let chunks: Vec<Result<Vec<u8>>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
        Self::new(meta, Box::pin(stream::iter(chunks)))
    }

    /// A response with a single-chunk body.
    pub fn from_text(meta: ResponseMeta, text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self::from_chunks(meta, [text.into_bytes()])
    }

    /// Read the whole body as text. Invalid UTF-8 is replaced, not rejected.
    pub async fn text(self) -> Result<String> {
        let mut bytes = Vec::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Decode the body as server-sent events, yielding each event's data.
    pub fn events(self) -> EventStream {
        let events = self.body.eventsource().map(|event| match event {
            Ok(event) => Ok(event.data),
            Err(e) => Err(RelayError::StreamError(format!("SSE parsing error: {e}"))),
        });
        Box::pin(events)
    }
}

/// Opens requests against a backend.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Send `request` and return once the response head is available.
    ///
    /// Implementations should give up when `cancel` fires. Nothing is
    /// delivered for a cycle after its cancellation.
    async fn open(
        &self,
        request: &TransportRequest,
        cancel: &CancelHandle,
    ) -> Result<TransportResponse>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse an existing client (proxies, TLS settings, default headers).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn open(
        &self,
        request: &TransportRequest,
        cancel: &CancelHandle,
    ) -> Result<TransportResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            RelayError::HttpError(format!("invalid method {}: {e}", request.method))
        })?;
        let mut builder = self
            .client
            .request(method, &request.url)
            .json(&request.payload());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = tokio::select! {
            sent = builder.send() => sent
                .map_err(|e| RelayError::HttpError(format!("Failed to send request: {e}")))?,
            _ = cancel.cancelled() => {
                return Err(RelayError::StreamError("request cancelled before open".into()));
            }
        };

        let mut meta = ResponseMeta::new(response.status().as_u16());
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                meta.headers
                    .insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        tracing::debug!(status = meta.status, url = %request.url, "transport opened");

        let body = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| RelayError::StreamError(format!("Stream error: {e}")))
        });
        Ok(TransportResponse::new(meta, Box::pin(body)))
    }
}

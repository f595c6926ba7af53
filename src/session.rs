//! Session controller
//!
//! One spawned task owns all session state and drives it through
//! `Opening -> Streaming -> {ToolRound}* -> Finishing -> Finished`, with
//! `Aborted` reachable from any live state. It multiplexes four inputs:
//! transport events tagged with their cycle number, the pacing ticker, the
//! cancel handle, and tool-round completions.
//!
//! Every session reports exactly once: `on_finish` with the full transcript,
//! or `on_error` (transport failure, or nothing was ever produced).

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use crate::assembler::SegmentAssembler;
use crate::cancel::CancelHandle;
use crate::config::RelayConfig;
use crate::conversation::{ConversationExtender, OpenAiMessagesExtender};
use crate::diagnostics::diagnostic_transcript;
use crate::error::{RelayError, Result};
use crate::pacing::{PacingEmitter, RevealBuffer, Tick};
use crate::parser::{ChunkParser, OpenAiChunkParser};
use crate::tools::{AfterToolFn, BeforeToolFn, ToolRegistry, run_tool_round};
use crate::transport::{EventTransport, TransportRequest};
use crate::types::{ResponseMeta, ToolCall, ToolCallMessage, ToolResultEvent, ToolResultMessage};

pub type UpdateFn = Arc<dyn Fn(&str, &str) + Send + Sync>;
pub type FinishFn = Arc<dyn Fn(&str, Option<&ResponseMeta>) + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(&RelayError) + Send + Sync>;
pub type EventFn = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Consumer callbacks. All optional.
#[derive(Clone, Default)]
pub struct StreamCallbacks {
    /// `(shown_so_far, delta)` for every revealed chunk.
    pub on_update: Option<UpdateFn>,
    /// `(full_transcript, last_response_meta)` once the session completes.
    pub on_finish: Option<FinishFn>,
    pub on_error: Option<ErrorFn>,
    pub on_before_tool: Option<BeforeToolFn>,
    pub on_after_tool: Option<AfterToolFn>,
    /// Lifecycle milestones, for observers that want more than text.
    pub on_event: Option<EventFn>,
}

impl std::fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCallbacks")
            .field("on_update", &self.on_update.is_some())
            .field("on_finish", &self.on_finish.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_before_tool", &self.on_before_tool.is_some())
            .field("on_after_tool", &self.on_after_tool.is_some())
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn with_finish(
        mut self,
        f: impl Fn(&str, Option<&ResponseMeta>) + Send + Sync + 'static,
    ) -> Self {
        self.on_finish = Some(Arc::new(f));
        self
    }

    pub fn with_error(mut self, f: impl Fn(&RelayError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn with_before_tool(mut self, f: impl Fn(&ToolCall) + Send + Sync + 'static) -> Self {
        self.on_before_tool = Some(Arc::new(f));
        self
    }

    pub fn with_after_tool(
        mut self,
        f: impl Fn(&ToolResultEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_after_tool = Some(Arc::new(f));
        self
    }

    pub fn with_event(mut self, f: impl Fn(&SessionEvent) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(f));
        self
    }
}

/// Controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A transport cycle was requested and has not delivered its head yet.
    Opening,
    Streaming,
    /// Pending tool calls are being executed and folded into the request.
    ToolRound,
    Finishing,
    Finished,
    Aborted,
    /// A transport error ended the session.
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Finished | SessionState::Aborted | SessionState::Failed
        )
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Finished | Aborted | Failed, _) => false,
            (_, Aborted | Failed) => true,
            (Opening, Streaming | Finishing) => true,
            (Streaming, Finishing) => true,
            (Finishing, ToolRound | Finished) => true,
            (ToolRound, Opening) => true,
            _ => false,
        }
    }
}

/// Lifecycle milestones reported through [`StreamCallbacks::on_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A transport cycle delivered its response head.
    Opened { cycle: u64, meta: ResponseMeta },
    /// Assembled text entered the reveal buffer.
    Fragment { text: String },
    ToolRoundStarted { round: usize, calls: Vec<ToolCall> },
    Finished { transcript: String },
    Aborted { transcript: String },
    Errored { error: RelayError },
}

/// What a completed session produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub transcript: String,
    /// Metadata of the last response that opened.
    pub meta: Option<ResponseMeta>,
    pub tool_rounds: usize,
    /// The consumer cancelled before the backend completed.
    pub aborted: bool,
}

/// Handle to a running session.
#[derive(Debug)]
pub struct StreamHandle {
    id: String,
    cancel: CancelHandle,
    task: JoinHandle<Result<SessionOutcome>>,
}

impl StreamHandle {
    /// Identifier attached to the session's log span.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancel the session. It finalizes with whatever text it has so far.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session to report.
    pub async fn join(self) -> Result<SessionOutcome> {
        self.task
            .await
            .map_err(|e| RelayError::InternalError(format!("session task failed: {e}")))?
    }
}

/// A configured relay. Cheap to clone; each [`Session::start`] runs an
/// independent session.
#[derive(Clone)]
pub struct Session {
    config: Arc<RelayConfig>,
    transport: Arc<dyn EventTransport>,
    parser: Arc<dyn ChunkParser>,
    tools: ToolRegistry,
    extender: Arc<dyn ConversationExtender>,
    callbacks: StreamCallbacks,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("tools", &self.tools)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn builder(transport: Arc<dyn EventTransport>) -> SessionBuilder {
        SessionBuilder::new(transport)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Spawn the controller for `request`. Must be called inside a tokio runtime.
    pub fn start(&self, request: TransportRequest) -> StreamHandle {
        self.start_with_callbacks(request, self.callbacks.clone())
    }

    /// Like [`Session::start`], reporting to `callbacks` instead of the
    /// builder's.
    pub fn start_with_callbacks(
        &self,
        request: TransportRequest,
        callbacks: StreamCallbacks,
    ) -> StreamHandle {
        let cancel = CancelHandle::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Controller {
            config: self.config.clone(),
            transport: self.transport.clone(),
            parser: self.parser.clone(),
            tools: self.tools.clone(),
            extender: self.extender.clone(),
            callbacks,
            cancel: cancel.clone(),
            request,
            tx,
            state: SessionState::Opening,
            assembler: SegmentAssembler::new(&self.config),
            buffer: RevealBuffer::new(),
            emitter: PacingEmitter::new(self.config.reveal_divisor),
            pending_calls: Vec::new(),
            meta: None,
            cycle: 0,
            cycle_done: false,
            disposition: Disposition::Stream,
            tool_rounds: 0,
            round_in_flight: false,
            abort_requested: false,
            reader: None,
            outcome: None,
        };
        let id = uuid::Uuid::new_v4().to_string();
        let span = tracing::debug_span!("relay_session", id = %id);
        let task = tokio::spawn(controller.run(rx).instrument(span));
        StreamHandle { id, cancel, task }
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    config: RelayConfig,
    transport: Arc<dyn EventTransport>,
    parser: Arc<dyn ChunkParser>,
    tools: ToolRegistry,
    extender: Arc<dyn ConversationExtender>,
    callbacks: StreamCallbacks,
}

impl SessionBuilder {
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        Self {
            config: RelayConfig::default(),
            transport,
            parser: Arc::new(OpenAiChunkParser),
            tools: ToolRegistry::new(),
            extender: Arc::new(OpenAiMessagesExtender),
            callbacks: StreamCallbacks::default(),
        }
    }

    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn parser(mut self, parser: impl ChunkParser + 'static) -> Self {
        self.parser = Arc::new(parser);
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn extender(mut self, extender: impl ConversationExtender + 'static) -> Self {
        self.extender = Arc::new(extender);
        self
    }

    pub fn callbacks(mut self, callbacks: StreamCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn build(self) -> Result<Session> {
        self.config.validate()?;
        Ok(Session {
            config: Arc::new(self.config),
            transport: self.transport,
            parser: self.parser,
            tools: self.tools,
            extender: self.extender,
            callbacks: self.callbacks,
        })
    }
}

/// How an opened response body is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// `text/plain`: the body is the whole answer.
    Complete,
    /// Failed status or unexpected content type: the body explains why.
    Diagnostic,
    Stream,
}

fn classify(meta: &ResponseMeta) -> Disposition {
    if meta.is_plain_text() {
        Disposition::Complete
    } else if meta.status != 200 || !meta.is_event_stream() {
        Disposition::Diagnostic
    } else {
        Disposition::Stream
    }
}

enum Input {
    Opened {
        cycle: u64,
        meta: ResponseMeta,
        disposition: Disposition,
    },
    Body {
        cycle: u64,
        text: String,
    },
    Message {
        cycle: u64,
        data: String,
    },
    Closed {
        cycle: u64,
    },
    Failed {
        cycle: u64,
        error: RelayError,
    },
    ToolRoundCompleted {
        round: usize,
        calls: Vec<ToolCall>,
        results: Vec<ToolResultMessage>,
    },
    Restart {
        round: usize,
    },
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Read one transport cycle and forward everything to the controller.
async fn read_cycle(
    transport: Arc<dyn EventTransport>,
    request: TransportRequest,
    cancel: CancelHandle,
    timeout: Duration,
    cycle: u64,
    tx: mpsc::UnboundedSender<Input>,
) {
    let response = match tokio::time::timeout(timeout, transport.open(&request, &cancel)).await {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => {
            let _ = tx.send(Input::Failed { cycle, error });
            return;
        }
        Err(_) => {
            let error = RelayError::Timeout(timeout.as_millis() as u64);
            let _ = tx.send(Input::Failed { cycle, error });
            return;
        }
    };

    let meta = response.meta.clone();
    tracing::info!(
        cycle,
        "response content type: {}",
        meta.content_type().unwrap_or("<none>")
    );
    let disposition = classify(&meta);
    if tx
        .send(Input::Opened {
            cycle,
            meta,
            disposition,
        })
        .is_err()
    {
        return;
    }

    if disposition != Disposition::Stream {
        let input = match response.text().await {
            Ok(text) => Input::Body { cycle, text },
            Err(error) => Input::Failed { cycle, error },
        };
        let _ = tx.send(input);
        return;
    }

    let mut events = response.events();
    while let Some(event) = events.next().await {
        let (input, stop) = match event {
            Ok(data) => (Input::Message { cycle, data }, false),
            Err(error) => (Input::Failed { cycle, error }, true),
        };
        if tx.send(input).is_err() || stop {
            return;
        }
    }
    let _ = tx.send(Input::Closed { cycle });
}

struct Controller {
    config: Arc<RelayConfig>,
    transport: Arc<dyn EventTransport>,
    parser: Arc<dyn ChunkParser>,
    tools: ToolRegistry,
    extender: Arc<dyn ConversationExtender>,
    callbacks: StreamCallbacks,
    cancel: CancelHandle,
    request: TransportRequest,
    tx: mpsc::UnboundedSender<Input>,

    state: SessionState,
    assembler: SegmentAssembler,
    buffer: RevealBuffer,
    emitter: PacingEmitter,
    pending_calls: Vec<ToolCall>,
    meta: Option<ResponseMeta>,
    /// Current transport cycle; events from older cycles are dropped.
    cycle: u64,
    /// The current cycle saw its done marker or close.
    cycle_done: bool,
    disposition: Disposition,
    tool_rounds: usize,
    round_in_flight: bool,
    abort_requested: bool,
    reader: Option<JoinHandle<()>>,
    outcome: Option<Result<SessionOutcome>>,
}

impl Controller {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>) -> Result<SessionOutcome> {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        self.open_cycle();
        while !self.state.is_terminal() {
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !self.abort_requested => self.on_abort(),
                input = rx.recv() => match input {
                    Some(input) => self.on_input(input),
                    // The controller holds a sender, so this never happens while it runs.
                    None => break,
                },
                _ = ticker.tick(), if self.emitter.is_running() => self.on_tick(),
            }
        }

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.outcome.take().unwrap_or_else(|| {
            Err(RelayError::InternalError(
                "session ended without an outcome".into(),
            ))
        })
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(from = ?self.state, to = ?next, "ignoring invalid session transition");
            return;
        }
        tracing::debug!(from = ?self.state, to = ?next, "session transition");
        self.state = next;
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(cb) = &self.callbacks.on_event {
            cb(&event);
        }
    }

    fn open_cycle(&mut self) {
        self.cycle += 1;
        self.cycle_done = false;
        self.assembler.begin_cycle();
        self.transition(SessionState::Opening);
        tracing::debug!(cycle = self.cycle, "start");

        let reader = tokio::spawn(
            read_cycle(
                self.transport.clone(),
                self.request.clone(),
                self.cancel.child(),
                self.config.request_timeout(),
                self.cycle,
                self.tx.clone(),
            )
            .in_current_span(),
        );
        if let Some(previous) = self.reader.replace(reader) {
            previous.abort();
        }
    }

    fn on_input(&mut self, input: Input) {
        match input {
            Input::Opened {
                cycle,
                meta,
                disposition,
            } if cycle == self.cycle => self.on_opened(meta, disposition),
            Input::Body { cycle, text } if cycle == self.cycle => self.on_body(text),
            Input::Message { cycle, data } if cycle == self.cycle => self.on_message(data),
            Input::Closed { cycle } if cycle == self.cycle => {
                if !self.cycle_done {
                    tracing::debug!(cycle, "end");
                    self.finish_cycle();
                }
            }
            Input::Failed { cycle, error } if cycle == self.cycle => self.fail(error),
            Input::ToolRoundCompleted {
                round,
                calls,
                results,
            } => self.on_tool_round_completed(round, calls, results),
            Input::Restart { round } => self.on_restart(round),
            _ => tracing::trace!("dropping event from a stale transport cycle"),
        }
    }

    fn on_opened(&mut self, meta: ResponseMeta, disposition: Disposition) {
        self.disposition = disposition;
        self.meta = Some(meta.clone());
        self.emit(SessionEvent::Opened {
            cycle: self.cycle,
            meta,
        });
        if disposition == Disposition::Stream {
            self.transition(SessionState::Streaming);
        }
    }

    fn on_body(&mut self, text: String) {
        let transcript = match self.disposition {
            Disposition::Complete => self.config.normalize_overload(text),
            _ => {
                let status = self.meta.as_ref().map(|m| m.status).unwrap_or_default();
                tracing::warn!(status, "response is not an event stream; reporting diagnostic");
                diagnostic_transcript(status, &text, &self.config)
            }
        };
        self.assembler.note_external(&transcript);
        self.commit(transcript);
        self.finish_cycle();
    }

    fn on_message(&mut self, data: String) {
        if self.cycle_done || self.state != SessionState::Streaming {
            return;
        }
        let payload = data.trim();
        if payload == self.config.done_marker {
            tracing::debug!(cycle = self.cycle, "done marker received");
            self.finish_cycle();
            return;
        }
        if payload.is_empty() {
            return;
        }
        let parser = &self.parser;
        let pending = &mut self.pending_calls;
        let parsed = panic::catch_unwind(AssertUnwindSafe(|| parser.parse(&data, pending)))
            .unwrap_or_else(|cause| {
                Err(RelayError::ParseError(format!(
                    "parser panicked: {}",
                    panic_message(cause.as_ref())
                )))
            });
        match parsed {
            Ok(Some(fragment)) => {
                if let Some(text) = self.assembler.push(fragment) {
                    self.commit(text);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, payload = %data, "parse error"),
        }
    }

    /// Queue assembled text for reveal.
    fn commit(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        self.buffer.push(&text);
        self.emitter.start();
        self.emit(SessionEvent::Fragment { text });
    }

    fn on_tick(&mut self) {
        if let Tick::Revealed(chunk) = self.emitter.tick(&mut self.buffer, false) {
            self.reveal(&chunk);
        }
    }

    fn reveal(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        if let Some(cb) = &self.callbacks.on_update {
            cb(self.buffer.shown(), chunk);
        }
    }

    fn finish_cycle(&mut self) {
        self.cycle_done = true;
        self.transition(SessionState::Finishing);

        if self.pending_calls.is_empty() {
            self.finalize();
        } else if self.tool_rounds >= self.config.max_tool_rounds {
            tracing::warn!(
                rounds = self.tool_rounds,
                discarded = self.pending_calls.len(),
                "tool round limit reached; discarding pending tool calls"
            );
            self.pending_calls.clear();
            self.finalize();
        } else {
            self.start_tool_round();
        }
    }

    fn start_tool_round(&mut self) {
        let calls = mem::take(&mut self.pending_calls);
        self.tool_rounds += 1;
        self.round_in_flight = true;
        let round = self.tool_rounds;
        self.transition(SessionState::ToolRound);
        tracing::debug!(round, calls = calls.len(), "tool round");
        self.emit(SessionEvent::ToolRoundStarted {
            round,
            calls: calls.clone(),
        });

        let registry = self.tools.clone();
        let config = self.config.clone();
        let on_before = self.callbacks.on_before_tool.clone();
        let on_after = self.callbacks.on_after_tool.clone();
        let tx = self.tx.clone();
        tokio::spawn(
            async move {
                let results =
                    run_tool_round(&registry, &calls, &config, on_before, on_after).await;
                let _ = tx.send(Input::ToolRoundCompleted {
                    round,
                    calls,
                    results,
                });
            }
            .in_current_span(),
        );
    }

    fn on_tool_round_completed(
        &mut self,
        round: usize,
        calls: Vec<ToolCall>,
        results: Vec<ToolResultMessage>,
    ) {
        if round != self.tool_rounds || self.state != SessionState::ToolRound {
            return;
        }
        self.round_in_flight = false;
        let call_message = ToolCallMessage::new(calls);
        if let Err(e) = self
            .extender
            .extend(&mut self.request.body, &call_message, &results)
        {
            self.fail(e);
            return;
        }
        if self.abort_requested {
            self.finalize();
            return;
        }

        let delay = self.config.tool_restart_delay();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Input::Restart { round });
        });
    }

    fn on_restart(&mut self, round: usize) {
        if round != self.tool_rounds
            || self.state != SessionState::ToolRound
            || self.abort_requested
        {
            return;
        }
        tracing::debug!(round, "restart");
        self.open_cycle();
    }

    fn on_abort(&mut self) {
        self.abort_requested = true;
        if self.round_in_flight {
            tracing::debug!(
                "abort requested during tool round; finalizing once results are folded"
            );
            return;
        }
        tracing::debug!("abort requested");
        self.finalize();
    }

    /// Flush, report once, and stop. Later calls are no-ops.
    fn finalize(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        let empty = match self.emitter.tick(&mut self.buffer, true) {
            Tick::Drained { flushed, empty } => {
                self.reveal(&flushed);
                empty
            }
            _ => self.buffer.is_empty(),
        };
        let aborted = self.abort_requested;
        self.transition(if aborted {
            SessionState::Aborted
        } else {
            SessionState::Finished
        });

        if empty {
            tracing::warn!(aborted, "session produced no text");
            self.report_error(RelayError::EmptyResponse);
            self.outcome = Some(Err(RelayError::EmptyResponse));
            return;
        }

        let transcript = self.buffer.transcript();
        tracing::debug!(
            chars = transcript.len(),
            rounds = self.tool_rounds,
            aborted,
            "finish"
        );
        if let Some(cb) = &self.callbacks.on_finish {
            cb(&transcript, self.meta.as_ref());
        }
        self.emit(if aborted {
            SessionEvent::Aborted {
                transcript: transcript.clone(),
            }
        } else {
            SessionEvent::Finished {
                transcript: transcript.clone(),
            }
        });
        self.outcome = Some(Ok(SessionOutcome {
            transcript,
            meta: self.meta.clone(),
            tool_rounds: self.tool_rounds,
            aborted,
        }));
    }

    /// End the session on a transport error. Buffered text is still revealed
    /// so the consumer's view matches what was received.
    fn fail(&mut self, error: RelayError) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Tick::Drained { flushed, .. } = self.emitter.stop(&mut self.buffer) {
            self.reveal(&flushed);
        }
        tracing::warn!(error = %error, cycle = self.cycle, "session failed");
        self.transition(SessionState::Failed);
        self.report_error(error.clone());
        self.outcome = Some(Err(error));
    }

    fn report_error(&self, error: RelayError) {
        if let Some(cb) = &self.callbacks.on_error {
            cb(&error);
        }
        self.emit(SessionEvent::Errored { error });
    }
}

//! Conversation engine event loop
//!
//! One task owns the history and the pending turn. It serially handles
//! caller commands, transfer events and the inactivity deadline, so the
//! only race left is completion versus timeout, settled by [`TurnArbiter`].

use super::arbiter::{TurnArbiter, TurnPhase};
use super::EngineEvent;
use crate::config::ChatConfig;
use crate::history::{Message, MessageStore, Role};
use crate::llm::{
    build_request_body, normalize_tool_calls, parse_final_reply, remove_tags, ChatError, HttpRequest,
    NormalizedToolCalls, ParseOutcome, Reply, StreamContext, StreamOutcome, ToolCallRequest,
    ToolDeclaration, Transport, EMPTY_CONTENT,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const ASYNC_TIMEOUT: &str = "Async request timeout";
const STREAM_TIMEOUT: &str = "Stream request timeout";
const SYNC_TIMEOUT: &str = "Request timeout";
const SYNC_TOOL_CALLS: &str = "Tool calls not supported in sync mode";
const THINK_TAG: &str = "think";

/// Requests from [`super::EngineHandle`]
pub(super) enum Command {
    SendSync {
        text: String,
        reply: oneshot::Sender<Result<String, ChatError>>,
    },
    SendAsync {
        text: String,
    },
    Continue,
    AddToolMessage {
        tool_call_id: String,
        content: String,
        reply: oneshot::Sender<Message>,
    },
    History {
        reply: oneshot::Sender<Vec<Message>>,
    },
    ClearHistory,
    Configure {
        config: ChatConfig,
    },
    SetTools {
        tools: Vec<ToolDeclaration>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TurnId(u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn-{}", self.0)
    }
}

/// Reported by transfer tasks back to the loop
enum TurnEvent {
    Chunk {
        turn: TurnId,
        bytes: Vec<u8>,
    },
    /// Whole body of a non-streamed turn
    Completed {
        turn: TurnId,
        result: Result<Vec<u8>, ChatError>,
    },
    /// Connection closed for a streamed turn
    StreamClosed {
        turn: TurnId,
        error: Option<ChatError>,
    },
    SyncFinished {
        trigger: Message,
        result: Result<Vec<u8>, ChatError>,
        reply: oneshot::Sender<Result<String, ChatError>>,
    },
}

/// The one in-flight async turn
struct PendingTurn {
    id: TurnId,
    /// Last history message when the request was issued
    trigger: Message,
    arbiter: TurnArbiter,
    /// Present for streamed turns
    stream: Option<StreamContext>,
    deadline: Instant,
}

pub(super) struct ConversationEngine {
    config: ChatConfig,
    tools: Vec<ToolDeclaration>,
    history: MessageStore,
    transport: Arc<dyn Transport>,
    commands: mpsc::UnboundedReceiver<Command>,
    turn_tx: mpsc::UnboundedSender<TurnEvent>,
    turn_rx: mpsc::UnboundedReceiver<TurnEvent>,
    events: broadcast::Sender<EngineEvent>,
    pending: Option<PendingTurn>,
    /// Cancellation for each async transfer still registered
    in_flight: HashMap<TurnId, CancellationToken>,
    next_turn: u64,
    /// Parent of every transfer token; cancelled when the loop exits
    shutdown: CancellationToken,
}

impl ConversationEngine {
    pub(super) fn new(
        config: ChatConfig,
        transport: Arc<dyn Transport>,
        commands: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        Self {
            config,
            tools: Vec::new(),
            history: MessageStore::new(),
            transport,
            commands,
            turn_tx,
            turn_rx,
            events,
            pending: None,
            in_flight: HashMap::new(),
            next_turn: 1,
            shutdown: CancellationToken::new(),
        }
    }

    pub(super) async fn run(mut self) {
        tracing::info!(
            server_url = %self.config.server_url,
            model = %self.config.model,
            stream = self.config.stream,
            "Starting conversation engine"
        );
        let _shutdown = self.shutdown.clone().drop_guard();

        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            tokio::select! {
                biased;
                Some(event) = self.turn_rx.recv() => self.handle_turn_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                () = wait_until(deadline) => self.handle_deadline(),
            }
        }

        tracing::info!(in_flight = self.in_flight.len(), "Conversation engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendSync { text, reply } => self.send_sync(text, reply),
            Command::SendAsync { text } => {
                tracing::info!("User message (async)");
                self.history.append(Role::User, text, Vec::new(), None);
                self.continue_conversation();
            }
            Command::Continue => self.continue_conversation(),
            Command::AddToolMessage {
                tool_call_id,
                content,
                reply,
            } => {
                let message = self.history.append(Role::Tool, content, Vec::new(), Some(tool_call_id));
                let _ = reply.send(message);
            }
            Command::History { reply } => {
                let _ = reply.send(self.history.all().to_vec());
            }
            Command::ClearHistory => {
                tracing::debug!(len = self.history.len(), "Clearing history");
                self.history.clear();
            }
            Command::Configure { config } => {
                tracing::info!(
                    server_url = %config.server_url,
                    model = %config.model,
                    stream = config.stream,
                    timeout_ms = config.timeout_ms,
                    "Engine reconfigured"
                );
                self.config = config;
            }
            Command::SetTools { tools } => {
                tracing::debug!(count = tools.len(), "Tools updated");
                self.tools = tools;
            }
        }
    }

    /// Issue the next async request for the current history.
    fn continue_conversation(&mut self) {
        let Some(trigger) = self.history.last().cloned() else {
            tracing::warn!("Nothing to continue: history is empty");
            return;
        };
        if let Some(pending) = &self.pending {
            tracing::error!(turn = %pending.id, "Previous turn has not finished");
            return;
        }
        if !self.in_flight.is_empty() {
            tracing::error!(
                count = self.in_flight.len(),
                "Inconsistent state: transfers registered without a pending turn"
            );
            return;
        }

        let streaming = self.config.stream;
        let request = match self.build_request(streaming) {
            Ok(request) => request,
            Err(e) => {
                self.emit_error(e.message);
                return;
            }
        };

        let id = TurnId(self.next_turn);
        self.next_turn += 1;
        let arbiter = TurnArbiter::new();
        arbiter.arm();
        let cancel = self.shutdown.child_token();
        self.in_flight.insert(id, cancel.clone());
        self.pending = Some(PendingTurn {
            id,
            trigger,
            arbiter,
            stream: streaming.then(StreamContext::new),
            deadline: Instant::now() + self.config.timeout(),
        });

        tracing::info!(turn = %id, streaming, history_len = self.history.len(), "Issuing request");
        tokio::spawn(drive_turn(
            Arc::clone(&self.transport),
            request,
            id,
            streaming,
            self.turn_tx.clone(),
            cancel,
        ));
    }

    fn send_sync(&mut self, text: String, reply: oneshot::Sender<Result<String, ChatError>>) {
        tracing::info!("User message (sync)");
        let trigger = self.history.append(Role::User, text, Vec::new(), None);
        let request = match self.build_request(false) {
            Ok(request) => request,
            Err(e) => {
                self.history.rollback(&trigger);
                let _ = reply.send(Err(e));
                return;
            }
        };

        let transport = Arc::clone(&self.transport);
        let events = self.turn_tx.clone();
        let timeout = self.config.timeout();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            let fetch = async {
                let response = transport.post(request).await?.error_for_status().await?;
                let body = response.collect().await?;
                Ok::<_, ChatError>(body)
            };
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                result = tokio::time::timeout(timeout, fetch) => {
                    result.unwrap_or_else(|_| Err(ChatError::timeout(SYNC_TIMEOUT)))
                }
            };
            let _ = events.send(TurnEvent::SyncFinished {
                trigger,
                result,
                reply,
            });
        });
    }

    fn finish_sync(
        &mut self,
        trigger: Message,
        result: Result<Vec<u8>, ChatError>,
        reply: oneshot::Sender<Result<String, ChatError>>,
    ) {
        let outcome = result.and_then(|body| match parse_final_reply(&body) {
            ParseOutcome::Reply(Reply::Text(text)) => {
                let content = self.clean_reply(&text);
                if content.is_empty() {
                    Err(ChatError::malformed(EMPTY_CONTENT))
                } else {
                    Ok(content)
                }
            }
            ParseOutcome::Reply(Reply::ToolCalls(_)) | ParseOutcome::UnsupportedToolShape { .. } => {
                Err(ChatError::unsupported(SYNC_TOOL_CALLS))
            }
            ParseOutcome::MalformedPayload(message) => Err(ChatError::malformed(message)),
        });

        match &outcome {
            Ok(content) => {
                self.history.append(Role::Assistant, content.clone(), Vec::new(), None);
            }
            Err(e) => {
                tracing::warn!(error = %e, kind = ?e.kind, "Sync request failed, rolling back");
                self.history.rollback(&trigger);
            }
        }
        if reply.send(outcome).is_err() {
            tracing::debug!("Sync caller went away before the reply");
        }
    }

    fn build_request(&self, streaming: bool) -> Result<HttpRequest, ChatError> {
        let prompt = self.config.effective_system_prompt();
        let body = build_request_body(
            self.history.all(),
            prompt.as_deref(),
            &self.tools,
            &self.config.model,
            streaming,
        )
        .map_err(|e| ChatError::invalid_request(format!("Failed to encode request: {e}")))?;
        Ok(HttpRequest::chat(
            &self.config.server_url,
            self.config.api_key.as_deref(),
            body,
            streaming,
        ))
    }

    fn handle_turn_event(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::Chunk { turn, bytes } => self.on_chunk(turn, &bytes),
            TurnEvent::Completed { turn, result } => self.on_completed(turn, result),
            TurnEvent::StreamClosed { turn, error } => self.finish_stream(turn, error),
            TurnEvent::SyncFinished {
                trigger,
                result,
                reply,
            } => self.finish_sync(trigger, result, reply),
        }
    }

    fn on_chunk(&mut self, turn: TurnId, bytes: &[u8]) {
        let timeout = self.config.timeout();
        let Some(pending) = self.pending.as_mut().filter(|p| p.id == turn) else {
            tracing::debug!(%turn, "Dropping chunk for a turn that is no longer pending");
            return;
        };
        pending.deadline = Instant::now() + timeout;
        let Some(stream) = pending.stream.as_mut() else {
            return;
        };

        let chunks = stream.feed(bytes);
        let done = stream.is_done();
        for chunk in chunks {
            self.emit(EngineEvent::StreamChunk { chunk });
        }
        if done {
            self.finish_stream(turn, None);
        }
    }

    fn on_completed(&mut self, turn: TurnId, result: Result<Vec<u8>, ChatError>) {
        let Some(_pending) = self.claim(turn, TurnPhase::Succeeded) else {
            return;
        };
        match result {
            Ok(body) => self.apply_reply(parse_final_reply(&body)),
            Err(e) => {
                tracing::error!(%turn, error = %e, kind = ?e.kind, "Request failed");
                self.emit_error(e.message);
            }
        }
    }

    fn finish_stream(&mut self, turn: TurnId, error: Option<ChatError>) {
        let Some(pending) = self.claim(turn, TurnPhase::Succeeded) else {
            return;
        };
        let Some(mut stream) = pending.stream else {
            return;
        };
        for chunk in stream.flush() {
            self.emit(EngineEvent::StreamChunk { chunk });
        }
        let outcome = stream.into_outcome();

        if let Some(e) = error {
            tracing::error!(%turn, error = %e, kind = ?e.kind, "Stream failed");
            let partial = self.clean_reply(&outcome.text);
            if !partial.is_empty() {
                self.history.append(Role::Assistant, partial, Vec::new(), None);
            }
            self.emit_error(e.message);
            return;
        }

        if let Some(drafts) = outcome.tool_calls {
            match normalize_tool_calls(drafts) {
                NormalizedToolCalls::Ready(calls) if !calls.is_empty() => {
                    let content = self.clean_reply(&outcome.text);
                    self.append_tool_calls(content, calls);
                    return;
                }
                NormalizedToolCalls::Ready(_) => {}
                NormalizedToolCalls::Unsupported { reason, raw } => {
                    self.emit(EngineEvent::UnsupportedToolCalls {
                        reason: reason.to_string(),
                        raw,
                    });
                    return;
                }
            }
        }

        let content = self.clean_reply(&outcome.text);
        if content.is_empty() {
            tracing::warn!(%turn, "Stream ended without content");
            self.emit_error(EMPTY_CONTENT);
            return;
        }
        self.history.append(Role::Assistant, content, Vec::new(), None);
        self.emit(EngineEvent::StreamFinished);
    }

    fn handle_deadline(&mut self) {
        let Some(turn) = self.pending.as_ref().map(|p| p.id) else {
            return;
        };
        let Some(pending) = self.claim(turn, TurnPhase::TimedOut) else {
            return;
        };
        tracing::warn!(%turn, timeout_ms = self.config.timeout_ms, "Turn timed out");

        let keep_trigger = pending.trigger.role == Role::Tool;
        let message = match pending.stream {
            Some(stream) => {
                let kept = self.keep_partial(stream.into_outcome());
                if !kept && !keep_trigger {
                    self.rollback(&pending.trigger);
                }
                STREAM_TIMEOUT
            }
            None => {
                if !keep_trigger {
                    self.rollback(&pending.trigger);
                }
                ASYNC_TIMEOUT
            }
        };
        if keep_trigger {
            tracing::warn!(%turn, "Timed out answering a tool result, keeping it");
        }
        self.emit(EngineEvent::Error {
            message: message.to_string(),
        });
    }

    /// Store whatever a timed-out stream produced. Returns whether anything
    /// was handed on.
    fn keep_partial(&mut self, outcome: StreamOutcome) -> bool {
        if outcome.is_empty() {
            return false;
        }
        let content = self.clean_reply(&outcome.text);
        if let Some(drafts) = outcome.tool_calls {
            match normalize_tool_calls(drafts) {
                NormalizedToolCalls::Ready(calls) if !calls.is_empty() => {
                    self.append_tool_calls(content, calls);
                    return true;
                }
                NormalizedToolCalls::Ready(_) => {}
                NormalizedToolCalls::Unsupported { reason, raw } => {
                    self.emit(EngineEvent::UnsupportedToolCalls {
                        reason: reason.to_string(),
                        raw,
                    });
                    return true;
                }
            }
        }
        if content.is_empty() {
            return false;
        }
        tracing::info!(len = content.len(), "Keeping partial reply");
        self.history.append(Role::Assistant, content, Vec::new(), None);
        true
    }

    fn apply_reply(&mut self, outcome: ParseOutcome) {
        match outcome {
            ParseOutcome::Reply(Reply::Text(text)) => {
                let content = self.clean_reply(&text);
                if content.is_empty() {
                    self.emit_error(EMPTY_CONTENT);
                    return;
                }
                self.history.append(Role::Assistant, content.clone(), Vec::new(), None);
                self.emit(EngineEvent::AsyncResponse { text: content });
            }
            ParseOutcome::Reply(Reply::ToolCalls(calls)) => {
                self.append_tool_calls(String::new(), calls);
            }
            ParseOutcome::MalformedPayload(message) => self.emit_error(message),
            ParseOutcome::UnsupportedToolShape { reason, raw } => {
                self.emit(EngineEvent::UnsupportedToolCalls {
                    reason: reason.to_string(),
                    raw,
                });
            }
        }
    }

    fn append_tool_calls(&mut self, content: String, calls: Vec<ToolCallRequest>) {
        tracing::debug!(count = calls.len(), "Tool calls received");
        self.history.append(Role::Assistant, content, calls.clone(), None);
        self.emit(EngineEvent::ToolCalls { calls });
    }

    /// Resolve the pending turn with `outcome` and unregister its transfer.
    /// The arbiter decides; only the winner removes the turn.
    fn claim(&mut self, turn: TurnId, outcome: TurnPhase) -> Option<PendingTurn> {
        let Some(current) = self.pending.as_ref().filter(|p| p.id == turn) else {
            tracing::debug!(%turn, "Ignoring event for a turn that is no longer pending");
            return None;
        };
        if !current.arbiter.claim(outcome) {
            tracing::warn!(%turn, phase = ?current.arbiter.phase(), "Turn was already resolved");
            return None;
        }
        let pending = self.pending.take()?;
        if let Some(cancel) = self.in_flight.remove(&pending.id) {
            cancel.cancel();
        }
        Some(pending)
    }

    fn rollback(&mut self, trigger: &Message) {
        if self.history.rollback(trigger) {
            tracing::info!(message_id = %trigger.id, "Rolled back unanswered message");
        }
    }

    fn clean_reply(&self, text: &str) -> String {
        if self.config.enable_thinking {
            remove_tags(THINK_TAG, text)
        } else {
            text.to_string()
        }
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }

    fn emit_error(&self, message: impl Into<String>) {
        self.emit(EngineEvent::Error {
            message: message.into(),
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Run one async transfer, reporting back to the loop until cancelled.
async fn drive_turn(
    transport: Arc<dyn Transport>,
    request: HttpRequest,
    turn: TurnId,
    streaming: bool,
    events: mpsc::UnboundedSender<TurnEvent>,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            tracing::debug!(%turn, "Transfer aborted");
        }
        () = transfer(&*transport, request, turn, streaming, &events) => {}
    }
}

async fn transfer(
    transport: &dyn Transport,
    request: HttpRequest,
    turn: TurnId,
    streaming: bool,
    events: &mpsc::UnboundedSender<TurnEvent>,
) {
    let response = match transport.post(request).await {
        Ok(response) => response.error_for_status().await,
        Err(e) => Err(e),
    };

    if !streaming {
        let result = match response {
            Ok(response) => response.collect().await,
            Err(e) => Err(e),
        };
        let _ = events.send(TurnEvent::Completed { turn, result });
        return;
    }

    let mut response = match response {
        Ok(response) => response,
        Err(e) => {
            let _ = events.send(TurnEvent::StreamClosed {
                turn,
                error: Some(e),
            });
            return;
        }
    };
    while let Some(chunk) = response.body.next().await {
        match chunk {
            Ok(bytes) => {
                if events.send(TurnEvent::Chunk { turn, bytes }).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = events.send(TurnEvent::StreamClosed {
                    turn,
                    error: Some(e),
                });
                return;
            }
        }
    }
    let _ = events.send(TurnEvent::StreamClosed { turn, error: None });
}

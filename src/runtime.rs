//! Conversation runtime
//!
//! [`spawn`] starts the engine task and returns an [`EngineHandle`]. Every
//! clone of the handle talks to the same conversation. Replies, stream
//! chunks, tool calls and errors are delivered as [`EngineEvent`]s on a
//! broadcast channel. Dropping the last handle stops the engine and aborts
//! any transfer still running.

mod arbiter;
mod engine;


pub use arbiter::{TurnArbiter, TurnPhase};

use crate::config::ChatConfig;
use crate::history::Message;
use crate::llm::{ChatError, ToolCallRequest, ToolDeclaration, Transport};
use engine::{Command, ConversationEngine};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

const EVENT_CAPACITY: usize = 1024;

/// Notifications for UI and tool-executor collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Complete non-streamed reply
    AsyncResponse { text: String },
    /// Incremental streamed text
    StreamChunk { chunk: String },
    /// Streamed reply stored in history
    StreamFinished,
    /// Assistant asked for tool calls; answer with `add_tool_message` and
    /// `continue_conversation`
    ToolCalls { calls: Vec<ToolCallRequest> },
    /// Tool calls the engine could not normalize, passed through untouched
    UnsupportedToolCalls { reason: String, raw: Vec<Value> },
    Error { message: String },
}

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<EngineEvent>,
}

/// Start an engine on the current tokio runtime.
pub fn spawn(config: ChatConfig, transport: Arc<dyn Transport>) -> EngineHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
    let engine = ConversationEngine::new(config, transport, command_rx, event_tx.clone());
    tokio::spawn(engine.run());
    EngineHandle {
        commands: command_tx,
        events: event_tx,
    }
}

impl EngineHandle {
    fn send(&self, command: Command) -> Result<(), ChatError> {
        self.commands.send(command).map_err(|_| ChatError::stopped())
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| ChatError::stopped())
    }

    /// Send a message and wait for the reply, bounded by the configured
    /// timeout. Fails on tool-call replies.
    pub async fn send_message_sync(&self, text: impl Into<String>) -> Result<String, ChatError> {
        let text = text.into();
        self.request(|reply| Command::SendSync { text, reply }).await?
    }

    /// Append a user message and start a turn. The reply arrives as an event.
    pub fn send_message_async(&self, text: impl Into<String>) -> Result<(), ChatError> {
        self.send(Command::SendAsync { text: text.into() })
    }

    /// Start a turn for the current history, e.g. after tool results.
    pub fn continue_conversation(&self) -> Result<(), ChatError> {
        self.send(Command::Continue)
    }

    /// Record a tool result. Does not start a turn.
    pub async fn add_tool_message(
        &self,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Message, ChatError> {
        let tool_call_id = tool_call_id.into();
        let content = content.into();
        self.request(|reply| Command::AddToolMessage {
            tool_call_id,
            content,
            reply,
        })
        .await
    }

    pub async fn history(&self) -> Result<Vec<Message>, ChatError> {
        self.request(|reply| Command::History { reply }).await
    }

    pub fn clear_history(&self) -> Result<(), ChatError> {
        self.send(Command::ClearHistory)
    }

    /// Replace the configuration; takes effect from the next request.
    pub fn configure(&self, config: ChatConfig) -> Result<(), ChatError> {
        config
            .validate()
            .map_err(|e| ChatError::invalid_request(e.to_string()))?;
        self.send(Command::Configure { config })
    }

    pub fn set_tools(&self, tools: Vec<ToolDeclaration>) -> Result<(), ChatError> {
        self.send(Command::SetTools { tools })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Events as a stream. Lagged receivers skip ahead with a warning.
    pub fn events(&self) -> impl Stream<Item = EngineEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                    None
                }
            }
        })
    }
}

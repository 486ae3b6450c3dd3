//! Companion Chat - conversation engine for `OpenAI`-compatible backends
//!
//! Keeps an ordered message history, sends it to a chat-completions
//! endpoint in sync, async or streamed mode, assembles streamed tool calls
//! and hands them to the host for execution.

pub mod config;
pub mod history;
pub mod llm;
pub mod runtime;

pub use config::{ChatConfig, ConfigError};
pub use history::{Message, MessageId, MessageStore, Role};
pub use llm::{
    remove_code_blocks, remove_tags, ChatError, ChatErrorKind, LoggingTransport, ReqwestTransport,
    ToolCallRequest, ToolDeclaration, Transport,
};
pub use runtime::{spawn, EngineEvent, EngineHandle};

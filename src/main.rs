//! Companion Chat - interactive terminal client
//!
//! Reads user lines from stdin and prints replies as they arrive.
//! `--config <file>` loads a JSON config, otherwise `COMPANION_*`
//! environment variables are used.

use companion_chat::{
    spawn, ChatConfig, EngineEvent, EngineHandle, LoggingTransport, ReqwestTransport,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TOOL_UNAVAILABLE: &str =
    r#"[{"type":"text","text":"Tool execution is not available in this client"}]"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = match config_path() {
        Some(path) => ChatConfig::from_file(&path)?,
        None => ChatConfig::from_env()?,
    };
    config.validate()?;
    tracing::info!(?config, "Configuration loaded");

    let transport = LoggingTransport::new(Arc::new(ReqwestTransport::new()?));
    let handle = spawn(config, Arc::new(transport));
    tokio::spawn(print_events(handle.clone(), handle.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" | "/exit" => break,
            "/clear" => handle.clear_history()?,
            "/history" => {
                for message in handle.history().await? {
                    println!("[{}] {}: {}", message.id, message.role.as_str(), message.content);
                }
            }
            text => handle.send_message_async(text)?,
        }
        prompt();
    }

    tracing::info!("Shutting down");
    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "companion_chat=info".into());
    let json = std::env::var("COMPANION_LOG_JSON").is_ok_and(|v| v == "1");

    // Logs go to stderr so they never interleave with replies on stdout.
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

async fn print_events(handle: EngineHandle, mut events: broadcast::Receiver<EngineEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            EngineEvent::AsyncResponse { text } => println!("\n{text}"),
            EngineEvent::StreamChunk { chunk } => {
                print!("{chunk}");
                let _ = std::io::stdout().flush();
            }
            EngineEvent::StreamFinished => println!(),
            EngineEvent::ToolCalls { calls } => {
                for call in calls {
                    println!("\n[tool call] {}({})", call.function.name, call.function.arguments);
                    if let Err(e) = handle.add_tool_message(call.id, TOOL_UNAVAILABLE).await {
                        tracing::error!(error = %e, "Failed to record tool result");
                        return;
                    }
                }
                if handle.continue_conversation().is_err() {
                    return;
                }
            }
            EngineEvent::UnsupportedToolCalls { reason, raw } => {
                println!("\n[unsupported tool calls: {reason}] {}", raw.len());
            }
            EngineEvent::Error { message } => eprintln!("\nerror: {message}"),
        }
    }
}

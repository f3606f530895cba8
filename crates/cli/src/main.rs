//! Headless driver for the AgentCanvas session core.
//!
//! A line-oriented REPL: plain input runs a full orchestrated turn, slash
//! commands manage the thread, canvas, and model list. This is the single
//! well-behaved caller the session's cooperative concurrency model assumes.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use agentcanvas_core::session::{CanvasPhase, CanvasState, SessionEvent};
use agentcanvas_core::{ChatSession, SettingsStore};
use agentcanvas_llm::{ProviderConfig, create_provider, fetch_models_for_provider};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Environment fallback used when the settings file carries no API key.
fn provider_from_environment() -> Option<ProviderConfig> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;

    let base_url = std::env::var("OPENAI_BASE_URL")
        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

    let default_model = std::env::var("OPENAI_MODEL")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    Some(ProviderConfig::new("openai", api_key, base_url, default_model))
}

/// Renders session events to the terminal. Content events carry the full
/// buffer, so the printer tracks how much of each message it already wrote
/// and emits only the new suffix.
async fn print_events(mut events: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) {
    let mut written: HashMap<u64, usize> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::MessageContentReplaced { id, content } => {
                let seen = written.entry(id.0).or_insert(0);
                if content.len() >= *seen && content.is_char_boundary(*seen) {
                    print!("{}", &content[*seen..]);
                } else {
                    // The buffer shrank (placeholder cleared); start over.
                    println!();
                    print!("{content}");
                }
                *seen = content.len();
                let _ = std::io::stdout().flush();
            }
            SessionEvent::MessageImageAttached { url, .. } => {
                println!("\n[image] {url}");
            }
            SessionEvent::CanvasStateChanged { snapshot } => match snapshot.phase {
                CanvasPhase::Open => println!("\n[canvas] open"),
                CanvasPhase::Minimized => println!("\n[canvas] minimized"),
                CanvasPhase::Closed => println!("\n[canvas] closed"),
            },
            SessionEvent::CanvasTitleChanged { title } => {
                println!("\n[canvas] {title}");
            }
            SessionEvent::ThreadStarted { thread_id } => {
                println!("\n[thread] {thread_id}");
            }
            SessionEvent::ErrorBanner { message } => {
                println!("\n[error] {message}");
            }
            SessionEvent::QuotedTextSelected { text } => {
                println!("\n[quote] {text}");
            }
            SessionEvent::MessageAppended { .. }
            | SessionEvent::MessageRemoved { .. }
            | SessionEvent::CanvasContentReplaced { .. }
            | SessionEvent::LoadingChanged { .. } => {}
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let settings = Arc::new(SettingsStore::load());
    let snapshot = settings.snapshot();
    if let Err(error) = snapshot.validate() {
        eprintln!("Invalid settings: {error}");
        std::process::exit(1);
    }
    if settings.is_locked() {
        tracing::info!("API key provided by environment; settings are read-only");
    }

    let config = snapshot
        .to_provider_config()
        .or_else(provider_from_environment);
    let Some(config) = config else {
        eprintln!(
            "No API key configured. Set it in {:?} or export AGENTCANVAS_API_KEY.",
            SettingsStore::default_config_path()
        );
        std::process::exit(1);
    };

    let provider = match create_provider(config) {
        Ok(provider) => provider,
        Err(error) => {
            eprintln!("Failed to initialize provider: {error}");
            std::process::exit(1);
        }
    };

    let mut session = ChatSession::new(provider.clone(), settings);
    tokio::spawn(print_events(session.subscribe()));

    println!("AgentCanvas, thread {}", session.thread_id());
    println!("Commands: /new, /models, /canvas, /restore, /close, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::error!(error = %error, "failed to read input");
                break;
            }
        };
        let input = line.trim();

        match input {
            "" => {}
            "/quit" => break,
            "/new" => session.start_new_thread(),
            "/canvas" => match session.canvas() {
                CanvasState::Closed => println!("[canvas] closed"),
                CanvasState::Open { content, .. } | CanvasState::Minimized { content, .. } => {
                    println!("{content}");
                }
            },
            "/close" => {
                if session.close_canvas().is_err() {
                    println!("[canvas] nothing to close");
                }
            }
            "/restore" => {
                if session.restore_canvas().is_err() {
                    println!("[canvas] nothing to restore");
                }
            }
            "/models" => match fetch_models_for_provider(provider.as_ref()).await {
                Ok(catalog) => {
                    if let Some(warning) = catalog.warning {
                        println!("[models] {warning}");
                    }
                    for model in catalog.models {
                        println!("{}", model.id);
                    }
                }
                Err(error) => println!("[models] {error}"),
            },
            _ => {
                if let Err(error) = session.send_text(input).await {
                    println!("[error] {error}");
                }
                println!();
            }
        }
    }
}

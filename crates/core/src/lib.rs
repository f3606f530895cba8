#![deny(unsafe_code)]

//! AgentCanvas orchestration core.
//!
//! Ties a remote OpenAI-compatible completion capability to a conversation
//! session: per-thread task classification, streamed accumulation into chat
//! messages or the side-panel canvas document, the multi-stage canvas and
//! image flows, and the state machines guarding stream and canvas
//! lifecycles.

/// Stream-to-buffer folding with full-state update callbacks.
pub mod accumulate;
/// Task, language, and title resolution through the remote model.
pub mod classify;
/// Fenced code-block scanning over possibly-incomplete markdown.
pub mod markdown;
mod orchestrate;
/// Session state, state machines, events, and the client-facing surface.
pub mod session;
/// Model settings with file/environment layering and lock-down.
pub mod settings;

pub use accumulate::{AccumulateError, accumulate};
pub use classify::{DEFAULT_CANVAS_TITLE, DEFAULT_LANGUAGE, TaskClassifier};
pub use markdown::{BlockSpan, CodeBlock, find_in_progress_block, find_longest_complete_block};
pub use orchestrate::{GENERATING_PLACEHOLDER, IMAGE_PLACEHOLDER};
pub use session::{
    CanvasPhase, CanvasSnapshot, CanvasState, ChatSession, Message, MessageId, MessageStatus,
    SessionError, SessionEvent, TaskMode, ThreadId,
};
pub use settings::{ProviderSettings, SettingsError, SettingsStore};

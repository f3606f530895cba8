//! Conversation state and the client-facing session surface.
//!
//! All mutation of the message list and the canvas goes through this module;
//! the orchestration flows in `crate::orchestrate` drive it but never touch
//! the collections directly.

/// Canvas lifecycle state machine.
pub mod canvas;
/// Typed observer events and the session event bus.
pub mod events;
/// Domain entities: thread/message ids, messages, task modes.
pub mod message;
/// Stream lifecycle state machine and the stream sink sum type.
pub mod stream;

pub use canvas::{CanvasState, CanvasTransition, CanvasTransitionRejection};
pub use events::{CanvasPhase, CanvasSnapshot, EventBus, SessionEvent};
pub use message::{Message, MessageId, MessageStatus, TaskMode, ThreadId};
pub use stream::{
    ActiveStream, StreamSink, StreamState, StreamTransition, StreamTransitionRejection,
};

use std::sync::Arc;

use agentcanvas_llm::{
    LlmProvider, MessageBody, ProviderMessage, Role, StreamSessionId, StreamTarget, ThreadEpoch,
};
use snafu::{OptionExt, Snafu, ensure};
use tokio::sync::mpsc;

use crate::markdown;
use crate::settings::SettingsStore;

#[derive(Debug, Snafu)]
pub enum SessionError {
    #[snafu(display("a generation turn is already in flight"))]
    TurnInFlight,
    #[snafu(display("no message with id {id:?} exists in this thread"))]
    UnknownMessage { id: MessageId },
    #[snafu(display("message {id:?} is not an assistant reply"))]
    NotAnAssistantMessage { id: MessageId },
    #[snafu(display("the canvas is not open"))]
    CanvasNotOpen,
    #[snafu(display("the canvas is not minimized"))]
    CanvasNotMinimized,
}

/// Per-thread state, replaced wholesale on `start_new_thread`.
pub(crate) struct ThreadState {
    pub(crate) thread_id: ThreadId,
    pub(crate) epoch: ThreadEpoch,
    pub(crate) messages: Vec<Message>,
    /// Classification result, resolved once per thread and reused.
    pub(crate) mode: Option<TaskMode>,
    /// Detected language, resolved once per thread and reused.
    pub(crate) user_language: Option<String>,
    pub(crate) stream: StreamState,
    pub(crate) active: Option<ActiveStream>,
    pub(crate) canvas: CanvasState,
    pub(crate) canvas_title: Option<String>,
    pub(crate) is_loading: bool,
}

impl ThreadState {
    fn new(epoch: ThreadEpoch) -> Self {
        Self {
            thread_id: ThreadId::generate(),
            epoch,
            messages: Vec::new(),
            mode: None,
            user_language: None,
            stream: StreamState::Idle,
            active: None,
            canvas: CanvasState::Closed,
            canvas_title: None,
            is_loading: false,
        }
    }
}

/// One user's conversation session: message list, canvas, stream lifecycle,
/// and the orchestrated send/edit/regenerate surface.
///
/// Driven by a single caller through `&mut self`; it is not a concurrent API.
pub struct ChatSession {
    pub(crate) provider: Arc<dyn LlmProvider>,
    pub(crate) settings: Arc<SettingsStore>,
    pub(crate) events: EventBus,
    pub(crate) thread: ThreadState,
    pub(crate) next_message_id: u64,
    pub(crate) next_stream_session_id: u64,
    pub(crate) next_thread_epoch: u64,
}

impl ChatSession {
    pub fn new(provider: Arc<dyn LlmProvider>, settings: Arc<SettingsStore>) -> Self {
        Self {
            provider,
            settings,
            events: EventBus::new(),
            thread: ThreadState::new(ThreadEpoch::new(1)),
            next_message_id: 1,
            next_stream_session_id: 1,
            next_thread_epoch: 2,
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread.thread_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.thread.messages
    }

    pub fn mode(&self) -> Option<TaskMode> {
        self.thread.mode
    }

    pub fn user_language(&self) -> Option<&str> {
        self.thread.user_language.as_deref()
    }

    pub fn canvas(&self) -> &CanvasState {
        &self.thread.canvas
    }

    pub fn canvas_title(&self) -> Option<&str> {
        self.thread.canvas_title.as_deref()
    }

    pub fn is_loading(&self) -> bool {
        self.thread.is_loading
    }

    /// Sends plain text, the common case of [`ChatSession::send_message`].
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send_message(MessageBody::Text(text.into())).await
    }

    /// Runs one full turn: append the user message, resolve task mode and
    /// language (cached per thread), then dispatch to the chat, image, or
    /// canvas flow.
    ///
    /// Orchestration failures never surface here; they are converted into
    /// message content and banner events. The only error is a second send
    /// while a turn is in flight.
    pub async fn send_message(&mut self, body: MessageBody) -> Result<(), SessionError> {
        ensure!(!self.thread.is_loading, TurnInFlightSnafu);

        let text = body.joined_text();
        let user_id = self.alloc_message_id();
        self.append_message(Message::user(user_id, body));

        self.set_loading(true);
        self.run_turn(text).await;
        self.finish_turn();
        Ok(())
    }

    /// Replaces a message's content with an explicit user edit.
    pub fn edit_message(&mut self, id: MessageId, body: MessageBody) -> Result<(), SessionError> {
        let message = self
            .thread
            .messages
            .iter_mut()
            .find(|message| message.id == id)
            .context(UnknownMessageSnafu { id })?;
        message.body = body;
        let content = message.visible_text();
        self.events
            .publish(SessionEvent::MessageContentReplaced { id, content });
        Ok(())
    }

    pub fn delete_message(&mut self, id: MessageId) -> Result<(), SessionError> {
        let index = self
            .thread
            .messages
            .iter()
            .position(|message| message.id == id)
            .context(UnknownMessageSnafu { id })?;
        self.thread.messages.remove(index);
        self.events.publish(SessionEvent::MessageRemoved { id });

        // A canvas anchored to a removed message has nothing to restore to.
        if self.thread.canvas.anchor() == Some(id) {
            let _ = self.apply_canvas(CanvasTransition::Reset);
        }
        Ok(())
    }

    /// Re-runs the assistant reply `id` over the history before it,
    /// optionally with a different model, replacing its content.
    pub async fn regenerate_message(
        &mut self,
        id: MessageId,
        model_override: Option<String>,
    ) -> Result<(), SessionError> {
        ensure!(!self.thread.is_loading, TurnInFlightSnafu);
        let message = self
            .thread
            .messages
            .iter()
            .find(|message| message.id == id)
            .context(UnknownMessageSnafu { id })?;
        ensure!(
            matches!(message.role, Role::Assistant),
            NotAnAssistantMessageSnafu { id }
        );

        let settings = self.settings.snapshot();
        let model = model_override
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .unwrap_or_else(|| settings.model.clone());

        self.set_loading(true);
        self.set_message_text(id, "");
        self.set_message_status(id, MessageStatus::Pending);
        self.run_regeneration(id, model, &settings).await;
        self.finish_turn();
        Ok(())
    }

    /// Opens or closes the canvas for a message, extracting the code block
    /// to show from the message's markdown. A message without any fenced
    /// block is a no-op.
    pub fn toggle_canvas(&mut self, message_id: MessageId, content: &str) {
        if let CanvasState::Open {
            message_id: current,
            ..
        } = &self.thread.canvas
            && *current == message_id
        {
            let _ = self.apply_canvas(CanvasTransition::ToggleFor {
                message_id,
                content: String::new(),
            });
            return;
        }

        // Prefer a block still being streamed; fall back to the longest
        // finished one. Spans include the fences so the canvas shows the
        // language tag.
        let block_text = markdown::find_in_progress_block(content, 0)
            .or_else(|| markdown::find_longest_complete_block(content))
            .map(|(_, span)| content[span.start..span.end].to_string());

        let Some(block_text) = block_text else {
            return;
        };

        let _ = self.apply_canvas(CanvasTransition::ToggleFor {
            message_id,
            content: block_text,
        });
    }

    /// Demotes an open canvas to its minimized affordance, keeping content.
    pub fn close_canvas(&mut self) -> Result<(), SessionError> {
        self.apply_canvas(CanvasTransition::Close)
            .map_err(|_| SessionError::CanvasNotOpen)
    }

    /// Restores a minimized canvas with its last known content.
    pub fn restore_canvas(&mut self) -> Result<(), SessionError> {
        self.apply_canvas(CanvasTransition::Restore)
            .map_err(|_| SessionError::CanvasNotMinimized)
    }

    /// Saves user edits made in the canvas, overwriting the originating
    /// message when it still exists.
    pub fn save_canvas_content(&mut self, edited: String) -> Result<(), SessionError> {
        let CanvasState::Open { message_id, .. } = &self.thread.canvas else {
            return CanvasNotOpenSnafu.fail();
        };
        let anchor = *message_id;

        let _ = self.apply_canvas(CanvasTransition::Replace(edited.clone()));
        if self.thread.messages.iter().any(|message| message.id == anchor) {
            self.set_message_text(anchor, &edited);
        }
        Ok(())
    }

    /// Resets the session to a fresh thread: new id, cleared messages,
    /// cleared mode/language caches, closed canvas. Any in-flight stream is
    /// abandoned; its late events fail the target-epoch check and are
    /// dropped.
    pub fn start_new_thread(&mut self) {
        let epoch = ThreadEpoch::new(self.next_thread_epoch);
        self.next_thread_epoch = self.next_thread_epoch.saturating_add(1);
        self.thread = ThreadState::new(epoch);

        self.events.publish(SessionEvent::ThreadStarted {
            thread_id: self.thread.thread_id.clone(),
        });
        self.events.publish(SessionEvent::CanvasStateChanged {
            snapshot: CanvasSnapshot::of(&self.thread.canvas),
        });
        self.events
            .publish(SessionEvent::LoadingChanged { loading: false });
    }

    /// Broadcasts a quoted-text selection to observers (the composer
    /// prefills from it).
    pub fn quote_text(&self, text: impl Into<String>) {
        self.events.publish(SessionEvent::QuotedTextSelected {
            text: text.into(),
        });
    }

    // --- internal state helpers, shared with the orchestration flows ---

    pub(crate) fn alloc_message_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_message_id);
        self.next_message_id = self.next_message_id.saturating_add(1);
        id
    }

    pub(crate) fn alloc_stream_target(&mut self) -> StreamTarget {
        let target = StreamTarget::new(
            self.thread.epoch,
            StreamSessionId::new(self.next_stream_session_id),
        );
        self.next_stream_session_id = self.next_stream_session_id.saturating_add(1);
        target
    }

    pub(crate) fn append_message(&mut self, message: Message) {
        self.events.publish(SessionEvent::MessageAppended {
            message: message.clone(),
        });
        self.thread.messages.push(message);
    }

    pub(crate) fn set_loading(&mut self, loading: bool) {
        if self.thread.is_loading != loading {
            self.thread.is_loading = loading;
            self.events
                .publish(SessionEvent::LoadingChanged { loading });
        }
    }

    /// Restores the stable interactive state after a turn, success or not.
    pub(crate) fn finish_turn(&mut self) {
        self.thread.active = None;
        if let Ok(next) = self.thread.stream.apply(StreamTransition::ResetToIdle) {
            self.thread.stream = next;
        }
        self.set_loading(false);
    }

    pub(crate) fn set_message_text(&mut self, id: MessageId, content: &str) {
        if let Some(message) = self
            .thread
            .messages
            .iter_mut()
            .find(|message| message.id == id)
        {
            message.set_text(content);
            self.events.publish(SessionEvent::MessageContentReplaced {
                id,
                content: content.to_string(),
            });
        }
    }

    pub(crate) fn set_message_status(&mut self, id: MessageId, status: MessageStatus) {
        if let Some(message) = self
            .thread
            .messages
            .iter_mut()
            .find(|message| message.id == id)
        {
            message.status = status;
        }
    }

    pub(crate) fn attach_message_image(&mut self, id: MessageId, url: &str) {
        if let Some(message) = self
            .thread
            .messages
            .iter_mut()
            .find(|message| message.id == id)
        {
            message.image_url = Some(url.to_string());
            self.events.publish(SessionEvent::MessageImageAttached {
                id,
                url: url.to_string(),
            });
        }
    }

    pub(crate) fn set_canvas_title(&mut self, title: String) {
        self.thread.canvas_title = Some(title.clone());
        self.events
            .publish(SessionEvent::CanvasTitleChanged { title });
    }

    /// Applies a canvas transition and publishes the resulting state and
    /// content changes.
    pub(crate) fn apply_canvas(
        &mut self,
        transition: CanvasTransition,
    ) -> Result<(), CanvasTransitionRejection> {
        let next = self.thread.canvas.apply(transition)?;

        let snapshot_changed = CanvasSnapshot::of(&next) != CanvasSnapshot::of(&self.thread.canvas);
        let content_changed = next.content() != self.thread.canvas.content();
        let content = next.content().map(str::to_string);
        self.thread.canvas = next;

        if snapshot_changed {
            self.events.publish(SessionEvent::CanvasStateChanged {
                snapshot: CanvasSnapshot::of(&self.thread.canvas),
            });
        }
        if content_changed && let Some(content) = content {
            self.events
                .publish(SessionEvent::CanvasContentReplaced { content });
        }
        Ok(())
    }

    /// Conversation history as provider messages, excluding `exclude` and
    /// anything blank or not finished.
    pub(crate) fn build_history(&self, exclude: MessageId) -> Vec<ProviderMessage> {
        self.thread
            .messages
            .iter()
            .filter(|message| message.id != exclude)
            .filter(|message| matches!(message.status, MessageStatus::Done))
            .filter(|message| !message.body.is_blank())
            .map(|message| ProviderMessage {
                role: message.role,
                body: message.body.clone(),
            })
            .collect()
    }

    /// History strictly before `before`, for regeneration.
    pub(crate) fn build_history_before(&self, before: MessageId) -> Vec<ProviderMessage> {
        self.thread
            .messages
            .iter()
            .take_while(|message| message.id != before)
            .filter(|message| matches!(message.status, MessageStatus::Done))
            .filter(|message| !message.body.is_blank())
            .map(|message| ProviderMessage {
                role: message.role,
                body: message.body.clone(),
            })
            .collect()
    }

    pub(crate) fn user_language_or_default(&self) -> String {
        self.thread
            .user_language
            .clone()
            .unwrap_or_else(|| crate::classify::DEFAULT_LANGUAGE.to_string())
    }
}

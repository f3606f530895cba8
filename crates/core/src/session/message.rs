use agentcanvas_llm::{MessageBody, Role, StreamSessionId};
use uuid::Uuid;

/// Opaque thread identifier, regenerated on "new conversation".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadId(String);

impl ThreadId {
    /// Generates a fresh thread id in the `thread_dvc_<16 hex>` shape.
    pub fn generate() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(format!("thread_dvc_{}", &raw[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier for one message within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Coarse task category resolved once per thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    Chat,
    Image,
    Canvas,
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Streaming(StreamSessionId),
    Done,
    Error(String),
}

/// One turn in the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub body: MessageBody,
    pub image_url: Option<String>,
    pub status: MessageStatus,
}

impl Message {
    pub fn new(id: MessageId, role: Role, body: MessageBody, status: MessageStatus) -> Self {
        Self {
            id,
            role,
            body,
            image_url: None,
            status,
        }
    }

    pub fn user(id: MessageId, body: MessageBody) -> Self {
        Self::new(id, Role::User, body, MessageStatus::Done)
    }

    /// Creates the empty assistant placeholder a turn streams into.
    pub fn assistant_placeholder(id: MessageId, placeholder: impl Into<String>) -> Self {
        Self::new(
            id,
            Role::Assistant,
            MessageBody::Text(placeholder.into()),
            MessageStatus::Pending,
        )
    }

    /// The message text as rendered in the transcript.
    pub fn visible_text(&self) -> String {
        self.body.joined_text()
    }

    /// Replaces the whole body with plain text, the shape streaming updates use.
    pub fn set_text(&mut self, content: impl Into<String>) {
        self.body = MessageBody::Text(content.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_are_prefixed_and_unique() {
        let first = ThreadId::generate();
        let second = ThreadId::generate();

        assert!(first.as_str().starts_with("thread_dvc_"));
        assert_eq!(first.as_str().len(), "thread_dvc_".len() + 16);
        assert_ne!(first, second);
    }

    #[test]
    fn placeholder_messages_start_pending() {
        let message = Message::assistant_placeholder(MessageId::new(7), "Generating...");
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.visible_text(), "Generating...");
        assert!(message.image_url.is_none());
    }
}

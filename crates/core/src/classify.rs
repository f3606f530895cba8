//! Task and language resolution through the remote model.
//!
//! Every function here degrades instead of failing: classification is a
//! routing hint, and a broken hint must never take down a turn.

use agentcanvas_llm::{ChatRequest, LlmProvider, ProviderMessage, Role};

use crate::session::TaskMode;

/// Fallback language when detection fails or returns nothing.
pub const DEFAULT_LANGUAGE: &str = "en-US";

/// Fallback canvas title when naming fails or returns nothing.
pub const DEFAULT_CANVAS_TITLE: &str = "Unknown Code Snippet";

/// Oracle replies are one short token; anything longer is already malformed.
const ORACLE_MAX_TOKENS: u64 = 10;
const ORACLE_TEMPERATURE: f64 = 0.1;

const TASK_CLASSIFIER_PROMPT: &str = "\
Divide the user's message into three task types: 'canvas', 'image', or 'chat'.
1. Is the user asking for a generated image?
   YES -> respond with 'image'
   NO -> continue
2. Can the answer fit in a few lines?
   YES -> respond with 'chat'
   NO -> continue
3. Will the answer contain code blocks or markdown?
   YES -> respond with 'canvas'
   NO -> continue
4. Otherwise, respond with 'chat'

Notice:
  - Canvas is a popout window that lets the user work on code or markdown.
  - Respond with ONLY one of these exact words: 'canvas', 'image', or 'chat'.

Examples:
Q: Tell me what this image is about?
A: chat

Q: Generate a picture of a cat.
A: image

Q: Write a function to calculate the sum of two numbers.
A: canvas

Q: Write me a plan for a trip to Japan.
A: canvas";

const LANGUAGE_DETECTOR_PROMPT: &str = "\
Detect the language of the following user message. Respond ONLY with the \
language code (e.g., zh-TW, en-US, ja-JP, ko-KR, fr-FR, etc). No explanation, \
no extra text.";

const CANVAS_TITLE_PROMPT: &str = "\
You are an assistant that names code snippets concisely.";

/// Maps the oracle's literal reply onto a task mode.
///
/// Only the exact (trimmed, lowercased) words count; everything else is chat.
fn parse_task_reply(reply: &str) -> TaskMode {
    match reply.trim().to_lowercase().as_str() {
        "canvas" => TaskMode::Canvas,
        "image" => TaskMode::Image,
        _ => TaskMode::Chat,
    }
}

/// Classifies user input and detects its language via the remote model.
pub struct TaskClassifier<'a> {
    provider: &'a dyn LlmProvider,
    model_id: &'a str,
}

impl<'a> TaskClassifier<'a> {
    pub fn new(provider: &'a dyn LlmProvider, model_id: &'a str) -> Self {
        Self { provider, model_id }
    }

    fn oracle_request(&self, instruction: &str, user_text: &str) -> ChatRequest {
        ChatRequest::new(
            self.model_id,
            vec![
                ProviderMessage::text(Role::System, instruction),
                ProviderMessage::text(Role::User, user_text),
            ],
        )
        .with_temperature(ORACLE_TEMPERATURE)
        .with_max_tokens(ORACLE_MAX_TOKENS)
    }

    /// Maps free-text input to `chat | image | canvas`, defaulting to chat on
    /// any transport error or unparseable reply.
    pub async fn classify_task(&self, text: &str) -> TaskMode {
        if text.trim().is_empty() {
            return TaskMode::Chat;
        }

        match self
            .provider
            .complete(self.oracle_request(TASK_CLASSIFIER_PROMPT, text))
            .await
        {
            Ok(reply) => parse_task_reply(&reply),
            Err(error) => {
                tracing::warn!(error = %error, "task classification failed; defaulting to chat");
                TaskMode::Chat
            }
        }
    }

    /// Detects the user's natural language, defaulting to `en-US` on any
    /// error or empty reply.
    pub async fn detect_language(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return DEFAULT_LANGUAGE.to_string();
        }

        match self
            .provider
            .complete(self.oracle_request(LANGUAGE_DETECTOR_PROMPT, text))
            .await
        {
            Ok(reply) => {
                let language = reply.trim().to_string();
                if language.is_empty() {
                    DEFAULT_LANGUAGE.to_string()
                } else {
                    language
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "language detection failed; defaulting to en-US");
                DEFAULT_LANGUAGE.to_string()
            }
        }
    }

    /// Names the canvas document after its code, file-name style.
    pub async fn generate_canvas_title(&self, code: &str) -> String {
        let question = format!(
            "Given this code snippet, provide a short file name that describes \
             what the code does. Don't include words like \"code\", \"function\", \
             \"class\", etc. For example: xxx.py\nHere is the code block:\n{code}"
        );

        match self
            .provider
            .complete(self.oracle_request(CANVAS_TITLE_PROMPT, &question))
            .await
        {
            Ok(reply) => {
                let title = reply.trim().to_string();
                if title.is_empty() {
                    DEFAULT_CANVAS_TITLE.to_string()
                } else {
                    title
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "canvas title generation failed; using fallback");
                DEFAULT_CANVAS_TITLE.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exact_literals_leave_chat_mode() {
        assert_eq!(parse_task_reply("canvas"), TaskMode::Canvas);
        assert_eq!(parse_task_reply(" Canvas\n"), TaskMode::Canvas);
        assert_eq!(parse_task_reply("IMAGE"), TaskMode::Image);
        assert_eq!(parse_task_reply("Canvass"), TaskMode::Chat);
        assert_eq!(parse_task_reply("canvas mode"), TaskMode::Chat);
        assert_eq!(parse_task_reply(""), TaskMode::Chat);
    }
}

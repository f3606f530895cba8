//! Multi-stage turn orchestration: the canvas flows, image generation, and
//! the standard chat path.
//!
//! Every step catches its own failures and converts them into message
//! content or banner events; nothing here propagates past the step boundary.

use agentcanvas_llm::{
    ChatRequest, ProviderError, ProviderMessage, Role, StreamRequest, StreamTarget,
};
use snafu::Snafu;

use crate::accumulate::{AccumulateError, accumulate};
use crate::classify::{DEFAULT_LANGUAGE, TaskClassifier};
use crate::session::{
    ActiveStream, CanvasTransition, ChatSession, Message, MessageId, MessageStatus, SessionEvent,
    StreamSink, StreamState, StreamTransition, TaskMode,
};
use crate::settings::ProviderSettings;

/// Static placeholder shown in the chat bubble while code streams into the
/// canvas instead.
pub const GENERATING_PLACEHOLDER: &str = "Generating...";
/// Placeholder shown while an image turn is in flight.
pub const IMAGE_PLACEHOLDER: &str = "Creating your Image...";

const CANVAS_CODE_PROMPT: &str = "\
You are a canvas assistant. Provide only a single code block solution with \
language formatting (e.g., ```javascript). Start directly with the code block \
and do not include any explanations or comments outside the code block. Make \
the solution concise and complete.";

const CANVAS_EXPLAIN_PROMPT: &str = "\
Now explain the code block you provided. Give context on how it works and any \
important implementation details. Don't repeat the code itself, just provide \
the explanation.";

const CANVAS_FOLLOW_UP_PROMPT: &str = "\
You are a canvas assistant. Given the user's follow-up question and the \
current code block, answer the question concisely and do not include any code \
blocks in the answer. If the question requires code changes, mention that an \
updated code will be provided.";

const CANVAS_UPDATE_CODE_PROMPT: &str = "\
Given the user's follow-up question and the previous code, provide only the \
updated code block as a complete replacement. Use language formatting (e.g., \
```js). Do not include any explanation or comments outside the code block.";

const IMAGE_REFINE_PROMPT: &str = "\
You are a prompt engineering expert specializing in optimizing image \
generation prompts. Refine the user's input into a detailed, clear prompt \
that will produce a high-quality image. Include details about style, \
lighting, composition, and colors as appropriate, but keep the user's \
original intent. Respond with ONLY the refined prompt text, no explanations \
or additional text.";

const IMAGE_DESCRIBE_CONTEXT: &str = "\
The image has been generated by you. Describe in detail what it shows.";

const IMAGE_REFINE_TEMPERATURE: f64 = 0.7;
const IMAGE_REFINE_MAX_TOKENS: u64 = 500;

/// Keywords in a follow-up answer that suggest a code replacement should be
/// generated. A substring probe over prose, kept isolated so a structured
/// model-emitted flag can replace it.
const CODE_UPDATE_KEYWORDS: [&str; 5] = ["updated code", "new code", "modify", "change", "update"];

pub(crate) fn answer_requests_code_update(answer: &str) -> bool {
    let lowered = answer.to_lowercase();
    CODE_UPDATE_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

/// Instruction riding the request preamble so replies land in the user's
/// language.
fn language_directive(language: &str) -> String {
    format!("You MUST respond in {language} language.")
}

/// Generic turn-failure string in the user's language; keyed by the primary
/// language subtag, English otherwise.
fn localized_failure(language: &str) -> &'static str {
    let primary = language
        .split(['-', '_'])
        .next()
        .unwrap_or("en")
        .to_ascii_lowercase();
    match primary.as_str() {
        "zh" => "生成回覆時發生錯誤，請重試。",
        "ja" => "応答の生成中にエラーが発生しました。もう一度お試しください。",
        _ => "Something went wrong while generating the response. Please try again.",
    }
}

/// Failure of one orchestration step; absorbed at the step boundary.
#[derive(Debug, Snafu)]
pub(crate) enum StepError {
    #[snafu(display("stream could not start: {reason}"))]
    StreamRejected { reason: String },
    #[snafu(display("{source}"))]
    Provider { source: ProviderError },
    #[snafu(display("{source}"))]
    Stream { source: AccumulateError },
}

impl ChatSession {
    /// Resolves mode/language for the thread (once), creates the assistant
    /// placeholder, and dispatches to the flow for the resolved mode.
    pub(crate) async fn run_turn(&mut self, text: String) {
        let settings = self.settings.snapshot();

        if self.thread.mode.is_none() {
            let provider = self.provider.clone();
            let classifier = TaskClassifier::new(provider.as_ref(), &settings.model);
            let mode = classifier.classify_task(&text).await;
            let language = classifier.detect_language(&text).await;
            tracing::info!(
                mode = ?mode,
                language = %language,
                thread_id = %self.thread.thread_id,
                "resolved task mode and language for thread"
            );
            self.thread.mode = Some(mode);
            self.thread.user_language = Some(language);
        }

        let mode = self.thread.mode.unwrap_or(TaskMode::Chat);
        let assistant_id = self.alloc_message_id();
        let placeholder = if mode == TaskMode::Image {
            IMAGE_PLACEHOLDER
        } else {
            ""
        };
        self.append_message(Message::assistant_placeholder(assistant_id, placeholder));

        match mode {
            TaskMode::Image => {
                self.handle_image_generation(&text, assistant_id, &settings)
                    .await;
            }
            TaskMode::Canvas => {
                let existing_code = self
                    .thread
                    .canvas
                    .content()
                    .filter(|content| !content.trim().is_empty())
                    .map(str::to_string);
                match existing_code {
                    Some(code) => {
                        self.handle_canvas_mode_next(&text, &code, assistant_id, &settings)
                            .await;
                    }
                    None => {
                        self.handle_canvas_mode(&text, assistant_id, &settings)
                            .await;
                    }
                }
            }
            TaskMode::Chat => {
                self.handle_standard_chat_mode(assistant_id, &settings).await;
            }
        }
    }

    /// Default path: one completion over the whole prior history, streamed
    /// into the assistant message.
    pub(crate) async fn handle_standard_chat_mode(
        &mut self,
        assistant_id: MessageId,
        settings: &ProviderSettings,
    ) {
        let language = self.user_language_or_default();
        let request = ChatRequest::new(settings.model.clone(), self.build_history(assistant_id))
            .with_preamble(language_directive(&language))
            .with_temperature(settings.temperature)
            .with_max_tokens(settings.max_tokens);

        if let Err(error) = self
            .stream_step(StreamSink::ChatMessage(assistant_id), request)
            .await
        {
            self.fail_turn_message(assistant_id, &language, &error);
        }
    }

    /// First canvas turn: open an empty canvas, stream a code-only reply
    /// into it, then stream a prose explanation into the chat message.
    pub(crate) async fn handle_canvas_mode(
        &mut self,
        user_text: &str,
        assistant_id: MessageId,
        settings: &ProviderSettings,
    ) {
        let language = self.user_language_or_default();

        let _ = self.apply_canvas(CanvasTransition::OpenFor {
            message_id: assistant_id,
            content: String::new(),
        });
        self.thread.canvas_title = None;
        self.set_message_text(assistant_id, GENERATING_PLACEHOLDER);

        // Code syntax is not localized; this step is pinned to en-US no
        // matter what the thread detected.
        let code_request = ChatRequest::new(
            settings.model.clone(),
            vec![
                ProviderMessage::text(Role::System, CANVAS_CODE_PROMPT),
                ProviderMessage::text(Role::User, user_text),
            ],
        )
        .with_preamble(language_directive(DEFAULT_LANGUAGE))
        .with_temperature(settings.temperature)
        .with_max_tokens(settings.max_tokens);

        let code = match self
            .stream_step(StreamSink::CanvasDocument, code_request)
            .await
        {
            Ok(code) => code,
            Err(error) => {
                // Whatever already streamed into the canvas stays there.
                self.fail_turn_message(assistant_id, &language, &error);
                return;
            }
        };

        let provider = self.provider.clone();
        let title = TaskClassifier::new(provider.as_ref(), &settings.model)
            .generate_canvas_title(&code)
            .await;
        self.set_canvas_title(title);

        self.set_message_text(assistant_id, "");
        let explain_request = ChatRequest::new(
            settings.model.clone(),
            vec![
                ProviderMessage::text(Role::System, CANVAS_EXPLAIN_PROMPT),
                ProviderMessage::text(Role::Assistant, code),
                ProviderMessage::text(Role::User, user_text),
            ],
        )
        .with_preamble(language_directive(&language))
        .with_temperature(settings.temperature)
        .with_max_tokens(settings.max_tokens);

        if let Err(error) = self
            .stream_step(StreamSink::ChatMessage(assistant_id), explain_request)
            .await
        {
            self.fail_turn_message(assistant_id, &language, &error);
        }
    }

    /// Follow-up canvas turn: answer without code, then regenerate the code
    /// block when the answer suggests a change is warranted.
    pub(crate) async fn handle_canvas_mode_next(
        &mut self,
        user_text: &str,
        existing_code: &str,
        assistant_id: MessageId,
        settings: &ProviderSettings,
    ) {
        let language = self.user_language_or_default();
        self.set_message_text(assistant_id, GENERATING_PLACEHOLDER);

        let answer_request = ChatRequest::new(
            settings.model.clone(),
            vec![
                ProviderMessage::text(Role::System, CANVAS_FOLLOW_UP_PROMPT),
                ProviderMessage::text(Role::Assistant, existing_code),
                ProviderMessage::text(Role::User, user_text),
            ],
        )
        .with_preamble(language_directive(&language))
        .with_temperature(settings.temperature)
        .with_max_tokens(settings.max_tokens);

        let answer = match self
            .stream_step(StreamSink::ChatMessage(assistant_id), answer_request)
            .await
        {
            Ok(answer) => answer,
            Err(error) => {
                self.fail_turn_message(assistant_id, &language, &error);
                return;
            }
        };

        if !answer_requests_code_update(&answer) {
            return;
        }

        let _ = self.apply_canvas(CanvasTransition::OpenFor {
            message_id: assistant_id,
            content: String::new(),
        });

        let update_request = ChatRequest::new(
            settings.model.clone(),
            vec![
                ProviderMessage::text(Role::System, CANVAS_UPDATE_CODE_PROMPT),
                ProviderMessage::text(Role::Assistant, existing_code),
                ProviderMessage::text(Role::User, user_text),
            ],
        )
        .with_preamble(language_directive(DEFAULT_LANGUAGE))
        .with_temperature(settings.temperature)
        .with_max_tokens(settings.max_tokens);

        if let Err(error) = self
            .stream_step(StreamSink::CanvasDocument, update_request)
            .await
        {
            self.fail_turn_message(assistant_id, &language, &error);
        }
    }

    /// Image turn: refine the prompt, generate the image, then stream a
    /// description with the image attached. Image-generation failure is
    /// fatal for the turn and surfaces as a dismissible banner.
    pub(crate) async fn handle_image_generation(
        &mut self,
        user_text: &str,
        assistant_id: MessageId,
        settings: &ProviderSettings,
    ) {
        let language = self.user_language_or_default();
        let provider = self.provider.clone();

        let refine_request = ChatRequest::new(
            settings.model.clone(),
            vec![
                ProviderMessage::text(Role::System, IMAGE_REFINE_PROMPT),
                ProviderMessage::text(Role::User, user_text),
            ],
        )
        .with_temperature(IMAGE_REFINE_TEMPERATURE)
        .with_max_tokens(IMAGE_REFINE_MAX_TOKENS);

        let refined = match provider.complete(refine_request).await {
            Ok(reply) if !reply.trim().is_empty() => reply.trim().to_string(),
            Ok(_) => user_text.to_string(),
            Err(error) => {
                tracing::warn!(error = %error, "prompt refinement failed; using the raw prompt");
                user_text.to_string()
            }
        };

        let image_url = match provider.generate_image(refined).await {
            Ok(url) => url,
            Err(error) => {
                tracing::error!(error = %error, "image generation failed");
                self.events.publish(SessionEvent::ErrorBanner {
                    message: format!("Image generation failed: {error}"),
                });
                self.set_message_text(assistant_id, localized_failure(&language));
                self.set_message_status(assistant_id, MessageStatus::Error(error.to_string()));
                return;
            }
        };

        self.attach_message_image(assistant_id, &image_url);
        self.set_message_text(assistant_id, "");

        let describe_request = ChatRequest::new(
            settings.model.clone(),
            vec![
                ProviderMessage::text(Role::Assistant, IMAGE_DESCRIBE_CONTEXT),
                ProviderMessage::with_image(
                    Role::User,
                    format!(
                        "Please describe this image that was generated based on the prompt: \"{user_text}\"."
                    ),
                    image_url,
                ),
            ],
        )
        .with_preamble(language_directive(&language))
        .with_temperature(settings.temperature)
        .with_max_tokens(settings.max_tokens);

        if let Err(error) = self
            .stream_step(StreamSink::ChatMessage(assistant_id), describe_request)
            .await
        {
            self.fail_turn_message(assistant_id, &language, &error);
        }
    }

    pub(crate) async fn run_regeneration(
        &mut self,
        id: MessageId,
        model: String,
        settings: &ProviderSettings,
    ) {
        let language = self.user_language_or_default();
        let request = ChatRequest::new(model, self.build_history_before(id))
            .with_preamble(language_directive(&language))
            .with_temperature(settings.temperature)
            .with_max_tokens(settings.max_tokens);

        if let Err(error) = self
            .stream_step(StreamSink::ChatMessage(id), request)
            .await
        {
            self.fail_turn_message(id, &language, &error);
        }
    }

    /// Runs one streamed completion into the given sink, pushing the full
    /// accumulated buffer into session state after every fragment.
    pub(crate) async fn stream_step(
        &mut self,
        sink: StreamSink,
        request: ChatRequest,
    ) -> Result<String, StepError> {
        let target = self.begin_stream(sink)?;
        let provider = self.provider.clone();

        let handle = match provider.stream_chat(StreamRequest::new(target, request)) {
            Ok(handle) => handle,
            Err(source) => {
                let error = StepError::Provider { source };
                self.abort_stream(target, &error);
                return Err(error);
            }
        };

        let result = accumulate(handle, |full| self.apply_stream_update(target, full)).await;

        match result {
            Ok(full) => {
                self.complete_stream(target);
                Ok(full)
            }
            Err(source) => {
                let error = StepError::Stream { source };
                self.abort_stream(target, &error);
                Err(error)
            }
        }
    }

    fn begin_stream(&mut self, sink: StreamSink) -> Result<StreamTarget, StepError> {
        let target = self.alloc_stream_target();
        let next = self
            .thread
            .stream
            .apply(StreamTransition::Start(target))
            .map_err(|rejection| StepError::StreamRejected {
                reason: format!("{rejection:?}"),
            })?;
        self.thread.stream = next;
        self.thread.active = Some(ActiveStream { target, sink });

        if let StreamSink::ChatMessage(id) = sink {
            self.set_message_status(id, MessageStatus::Streaming(target.session));
        }
        Ok(target)
    }

    /// Routes one full-buffer update to the active sink. Events whose target
    /// no longer matches the active stream are dropped; this is what makes
    /// late tokens from an abandoned request harmless.
    fn apply_stream_update(&mut self, target: StreamTarget, full: &str) {
        if !self.thread.stream.accepts_stream_event(target) {
            return;
        }
        let Some(active) = self.thread.active else {
            return;
        };
        if active.target != target {
            return;
        }

        match active.sink {
            StreamSink::ChatMessage(id) => self.set_message_text(id, full),
            StreamSink::CanvasDocument => {
                let _ = self.apply_canvas(CanvasTransition::Replace(full.to_string()));
            }
        }
    }

    fn complete_stream(&mut self, target: StreamTarget) {
        if let Ok(next) = self.thread.stream.apply(StreamTransition::Complete(target)) {
            self.thread.stream = next;
        }
        if let Some(active) = self.thread.active.take_if(|active| active.target == target)
            && let StreamSink::ChatMessage(id) = active.sink
        {
            self.set_message_status(id, MessageStatus::Done);
        }
    }

    fn abort_stream(&mut self, target: StreamTarget, error: &StepError) {
        if matches!(self.thread.stream, StreamState::Streaming(_)) {
            if let Ok(next) = self.thread.stream.apply(StreamTransition::Fail {
                target,
                message: error.to_string(),
            }) {
                self.thread.stream = next;
            }
        }
        let _ = self.thread.active.take_if(|active| active.target == target);
    }

    /// Converts a step failure into the localized in-message error string.
    /// Already-streamed canvas content is left intact.
    fn fail_turn_message(
        &mut self,
        id: MessageId,
        language: &str,
        error: &StepError,
    ) {
        tracing::error!(error = %error, message_id = ?id, "generation step failed");
        self.set_message_text(id, localized_failure(language));
        self.set_message_status(id, MessageStatus::Error(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_update_heuristic_matches_case_insensitively() {
        assert!(answer_requests_code_update(
            "An UPDATED CODE block will be provided."
        ));
        assert!(answer_requests_code_update(
            "You should modify the loop bound."
        ));
        assert!(!answer_requests_code_update(
            "The complexity is O(n log n); nothing else to do."
        ));
    }

    #[test]
    fn failure_strings_follow_the_primary_language_subtag() {
        assert!(localized_failure("zh-TW").contains("請重試"));
        assert!(localized_failure("ja").contains("エラー"));
        assert!(localized_failure("en-US").starts_with("Something went wrong"));
        assert!(localized_failure("fr-FR").starts_with("Something went wrong"));
    }

    #[test]
    fn language_directive_names_the_language() {
        assert_eq!(
            language_directive("zh-TW"),
            "You MUST respond in zh-TW language."
        );
    }
}

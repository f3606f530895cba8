//! End-to-end session scenarios against a scripted provider.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use agentcanvas_core::session::{CanvasState, SessionEvent};
use agentcanvas_core::settings::SettingsStore;
use agentcanvas_core::{ChatSession, MessageStatus, TaskClassifier, TaskMode};
use agentcanvas_llm::{
    BoxFuture, ChatRequest, LlmProvider, Model, ModelCatalog, ProviderError, ProviderResult,
    ProviderStreamHandle, ProviderWorker, StreamEvent, StreamEventPayload, StreamRequest,
    default_fallback_models, make_event_stream,
};

/// Scripted stream: either fragments followed by `Done`, or fragments
/// followed by an error event.
enum StreamScript {
    Fragments(Vec<&'static str>),
    FailAfter(Vec<&'static str>, &'static str),
}

/// Provider double that replays scripted completions, streams, and images in
/// order.
struct ScriptedProvider {
    completions: Mutex<VecDeque<Result<String, ()>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    images: Mutex<VecDeque<Result<String, ()>>>,
    fallback: Vec<Model>,
}

impl ScriptedProvider {
    fn new(
        completions: Vec<Result<&'static str, ()>>,
        streams: Vec<StreamScript>,
        images: Vec<Result<&'static str, ()>>,
    ) -> Self {
        Self {
            completions: Mutex::new(
                completions
                    .into_iter()
                    .map(|entry| entry.map(str::to_string))
                    .collect(),
            ),
            streams: Mutex::new(streams.into_iter().collect()),
            images: Mutex::new(
                images
                    .into_iter()
                    .map(|entry| entry.map(str::to_string))
                    .collect(),
            ),
            fallback: default_fallback_models(),
        }
    }

    fn scripted_error() -> ProviderError {
        ProviderError::BuildHttpRequestBody {
            stage: "scripted",
            message: "scripted failure".to_string(),
        }
    }

    fn remaining_completions(&self) -> usize {
        self.completions.lock().unwrap().len()
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "gpt-4o"
    }

    fn fallback_models(&self) -> &[Model] {
        &self.fallback
    }

    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
        Box::pin(async move { Ok(ModelCatalog::from_provider_api(self.fallback.clone())) })
    }

    fn complete<'a>(&'a self, _request: ChatRequest) -> BoxFuture<'a, ProviderResult<String>> {
        let next = self.completions.lock().unwrap().pop_front();
        Box::pin(async move {
            match next {
                Some(Ok(reply)) => Ok(reply),
                Some(Err(())) | None => Err(Self::scripted_error()),
            }
        })
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(Self::scripted_error)?;

        let target = request.target;
        let (event_tx, stream, _cancel_rx) = make_event_stream(target);
        let worker: ProviderWorker = Box::pin(async move {
            let (fragments, failure) = match script {
                StreamScript::Fragments(fragments) => (fragments, None),
                StreamScript::FailAfter(fragments, message) => (fragments, Some(message)),
            };
            for fragment in fragments {
                let _ = event_tx.send(StreamEvent {
                    target,
                    payload: StreamEventPayload::Delta(fragment.to_string()),
                });
            }
            let terminal = match failure {
                Some(message) => StreamEventPayload::Error(message.to_string()),
                None => StreamEventPayload::Done,
            };
            let _ = event_tx.send(StreamEvent {
                target,
                payload: terminal,
            });
        });

        Ok(ProviderStreamHandle { stream, worker })
    }

    fn generate_image<'a>(&'a self, _prompt: String) -> BoxFuture<'a, ProviderResult<String>> {
        let next = self.images.lock().unwrap().pop_front();
        Box::pin(async move {
            match next {
                Some(Ok(url)) => Ok(url),
                Some(Err(())) | None => Err(Self::scripted_error()),
            }
        })
    }
}

fn test_settings() -> Arc<SettingsStore> {
    Arc::new(SettingsStore::new(
        std::env::temp_dir().join("agentcanvas-session-tests/settings.json"),
    ))
}

fn session_with(provider: ScriptedProvider) -> ChatSession {
    ChatSession::new(Arc::new(provider), test_settings())
}

#[tokio::test]
async fn classifier_defaults_survive_a_broken_oracle() {
    let provider = ScriptedProvider::new(vec![Err(()), Err(())], Vec::new(), Vec::new());
    let classifier = TaskClassifier::new(&provider, "gpt-4o");

    assert_eq!(classifier.classify_task("anything at all").await, TaskMode::Chat);
    assert_eq!(classifier.detect_language("anything at all").await, "en-US");
}

#[tokio::test]
async fn canvas_turn_streams_code_into_canvas_and_prose_into_chat() {
    let provider = ScriptedProvider::new(
        vec![Ok("canvas"), Ok("en-US"), Ok("fib.py")],
        vec![
            StreamScript::Fragments(vec![
                "```python\n",
                "def fib(n):\n    return n if n < 2 else fib(n - 1) + fib(n - 2)\n",
                "```",
            ]),
            StreamScript::Fragments(vec![
                "This function computes Fibonacci numbers ",
                "with the classic recursive definition.",
            ]),
        ],
        Vec::new(),
    );
    let mut session = session_with(provider);

    session
        .send_text("write a python fibonacci function")
        .await
        .expect("turn runs");

    assert_eq!(session.mode(), Some(TaskMode::Canvas));
    assert_eq!(session.user_language(), Some("en-US"));
    assert_eq!(session.canvas_title(), Some("fib.py"));

    let CanvasState::Open { content, .. } = session.canvas() else {
        panic!("canvas should be open after a canvas turn");
    };
    assert!(content.starts_with("```python"));
    assert!(content.contains("def fib"));

    let assistant = session.messages().last().expect("assistant reply");
    let text = assistant.visible_text();
    assert!(text.contains("Fibonacci"));
    assert!(!text.contains("```"));
    assert_eq!(assistant.status, MessageStatus::Done);
    assert!(!session.is_loading());
}

#[tokio::test]
async fn image_turn_attaches_the_image_and_streams_a_description() {
    let provider = ScriptedProvider::new(
        vec![Ok("image"), Ok("en-US"), Ok("a vivid red fox, studio lighting")],
        vec![StreamScript::Fragments(vec![
            "A red fox ",
            "stands alert in fresh snow.",
        ])],
        vec![Ok("https://img.example/fox.png")],
    );
    let mut session = session_with(provider);
    let mut events = session.subscribe();

    session.send_text("draw a red fox").await.expect("turn runs");

    let assistant = session.messages().last().expect("assistant reply");
    assert_eq!(
        assistant.image_url.as_deref(),
        Some("https://img.example/fox.png")
    );
    assert!(assistant.visible_text().contains("red fox"));
    assert_eq!(assistant.status, MessageStatus::Done);

    let mut saw_attachment = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::MessageImageAttached { url, .. } => {
                saw_attachment = true;
                assert_eq!(url, "https://img.example/fox.png");
            }
            SessionEvent::ErrorBanner { message } => {
                panic!("image turn should not raise a banner: {message}");
            }
            _ => {}
        }
    }
    assert!(saw_attachment);
}

#[tokio::test]
async fn image_generation_failure_is_fatal_and_raises_a_banner() {
    let provider = ScriptedProvider::new(
        vec![Ok("image"), Ok("en-US"), Ok("refined prompt")],
        Vec::new(),
        vec![Err(())],
    );
    let mut session = session_with(provider);
    let mut events = session.subscribe();

    session.send_text("draw a red fox").await.expect("turn runs");

    let assistant = session.messages().last().expect("assistant reply");
    assert!(matches!(assistant.status, MessageStatus::Error(_)));
    assert!(assistant.image_url.is_none());

    let mut saw_banner = false;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::ErrorBanner { message } = event {
            saw_banner = true;
            assert!(message.contains("Image generation failed"));
        }
    }
    assert!(saw_banner);
    assert!(!session.is_loading());
}

#[tokio::test]
async fn follow_up_with_update_keywords_regenerates_the_canvas_code() {
    let provider = ScriptedProvider::new(
        vec![Ok("canvas"), Ok("en-US"), Ok("sum.py")],
        vec![
            StreamScript::Fragments(vec!["```python\ndef add(a, b):\n    return a + b\n```"]),
            StreamScript::Fragments(vec!["The function adds two numbers."]),
            StreamScript::Fragments(vec![
                "You should update the function to accept floats; updated code follows.",
            ]),
            StreamScript::Fragments(vec![
                "```python\ndef add(a: float, b: float) -> float:\n    return a + b\n```",
            ]),
        ],
        Vec::new(),
    );
    let mut session = session_with(provider);

    session
        .send_text("write an add function")
        .await
        .expect("first canvas turn");
    let remaining_after_first = {
        let CanvasState::Open { content, .. } = session.canvas() else {
            panic!("canvas open after first turn");
        };
        assert!(!content.contains("float"));
        content.len()
    };

    session
        .send_text("make it work with floats")
        .await
        .expect("follow-up turn");

    let CanvasState::Open { content, .. } = session.canvas() else {
        panic!("canvas still open after follow-up");
    };
    assert!(content.contains("float"));
    assert_ne!(content.len(), remaining_after_first);

    let answer = session.messages()[session.messages().len() - 1].visible_text();
    assert!(answer.contains("updated code"));
    assert!(!answer.contains("```"));
}

#[tokio::test]
async fn classification_runs_once_per_thread_and_reset_clears_the_caches() {
    let provider = Arc::new(ScriptedProvider::new(
        vec![Ok("chat"), Ok("fr-FR")],
        vec![
            StreamScript::Fragments(vec!["Bonjour!"]),
            StreamScript::Fragments(vec!["Encore bonjour."]),
        ],
        Vec::new(),
    ));
    let mut session = ChatSession::new(provider.clone(), test_settings());

    session.send_text("salut").await.expect("first turn");
    assert_eq!(session.mode(), Some(TaskMode::Chat));
    assert_eq!(session.user_language(), Some("fr-FR"));
    assert_eq!(provider.remaining_completions(), 0);

    // Second turn reuses the cached mode/language; an extra classification
    // attempt would fail loudly because the completion script is exhausted.
    session.send_text("encore").await.expect("second turn");
    let assistant = session.messages().last().expect("assistant reply");
    assert_eq!(assistant.visible_text(), "Encore bonjour.");

    let old_thread = session.thread_id().clone();
    session.start_new_thread();

    assert_ne!(session.thread_id(), &old_thread);
    assert_eq!(session.mode(), None);
    assert_eq!(session.user_language(), None);
    assert!(session.messages().is_empty());
    assert_eq!(session.canvas(), &CanvasState::Closed);
}

#[tokio::test]
async fn toggle_extracts_the_fenced_block_and_toggles_closed_on_repeat() {
    let provider = ScriptedProvider::new(Vec::new(), Vec::new(), Vec::new());
    let mut session = session_with(provider);

    let message = "Here you go:\n```python\nprint(1)\n```\nEnjoy.";
    let id = agentcanvas_core::MessageId::new(42);

    session.toggle_canvas(id, message);
    let CanvasState::Open { content, .. } = session.canvas() else {
        panic!("toggle should open the canvas");
    };
    assert_eq!(content, "```python\nprint(1)\n```");

    session.toggle_canvas(id, message);
    assert_eq!(session.canvas(), &CanvasState::Closed);

    // A message without any fenced block is a no-op.
    session.toggle_canvas(id, "plain prose only");
    assert_eq!(session.canvas(), &CanvasState::Closed);
}

#[tokio::test]
async fn saving_canvas_edits_overwrites_the_anchored_message() {
    let provider = ScriptedProvider::new(
        vec![Ok("canvas"), Ok("en-US"), Ok("add.py")],
        vec![
            StreamScript::Fragments(vec!["```python\ndef add(a, b):\n    return a + b\n```"]),
            StreamScript::Fragments(vec!["Adds two numbers."]),
        ],
        Vec::new(),
    );
    let mut session = session_with(provider);
    session.send_text("write an add function").await.expect("turn");

    let anchor = match session.canvas() {
        CanvasState::Open { message_id, .. } => *message_id,
        other => panic!("canvas should be open, got {other:?}"),
    };

    session
        .save_canvas_content("```python\ndef add(a, b):\n    return a + b  # edited\n```".to_string())
        .expect("canvas is open");

    assert!(session.canvas().content().unwrap().contains("# edited"));
    let anchored = session
        .messages()
        .iter()
        .find(|message| message.id == anchor)
        .expect("anchored message exists");
    assert!(anchored.visible_text().contains("# edited"));
}

#[tokio::test]
async fn edits_and_deletes_update_the_message_list() {
    let provider = ScriptedProvider::new(
        vec![Ok("chat"), Ok("en-US")],
        vec![StreamScript::Fragments(vec!["Hello!"])],
        Vec::new(),
    );
    let mut session = session_with(provider);
    session.send_text("hi").await.expect("turn");

    let user_id = session.messages()[0].id;
    session
        .edit_message(user_id, agentcanvas_llm::MessageBody::Text("hi there".to_string()))
        .expect("message exists");
    assert_eq!(session.messages()[0].visible_text(), "hi there");

    let assistant_id = session.messages()[1].id;
    session.delete_message(assistant_id).expect("message exists");
    assert_eq!(session.messages().len(), 1);

    let missing = session.delete_message(assistant_id);
    assert!(missing.is_err());
}

#[tokio::test]
async fn regeneration_replaces_an_assistant_reply_in_place() {
    let provider = ScriptedProvider::new(
        vec![Ok("chat"), Ok("en-US")],
        vec![
            StreamScript::Fragments(vec!["First answer."]),
            StreamScript::Fragments(vec!["Second, better answer."]),
        ],
        Vec::new(),
    );
    let mut session = session_with(provider);
    session.send_text("hi").await.expect("turn");

    let assistant_id = session.messages()[1].id;
    session
        .regenerate_message(assistant_id, None)
        .await
        .expect("assistant reply exists");

    assert_eq!(session.messages().len(), 2);
    let assistant = &session.messages()[1];
    assert_eq!(assistant.visible_text(), "Second, better answer.");
    assert_eq!(assistant.status, MessageStatus::Done);

    let user_id = session.messages()[0].id;
    assert!(session.regenerate_message(user_id, None).await.is_err());
}

#[tokio::test]
async fn chat_generation_failure_becomes_a_localized_message() {
    let provider = ScriptedProvider::new(
        vec![Ok("chat"), Ok("en-US")],
        vec![StreamScript::FailAfter(vec!["partial "], "remote reset")],
        Vec::new(),
    );
    let mut session = session_with(provider);

    session.send_text("hello").await.expect("turn runs");

    let assistant = session.messages().last().expect("assistant reply");
    assert!(assistant.visible_text().starts_with("Something went wrong"));
    assert!(matches!(assistant.status, MessageStatus::Error(_)));
    assert!(!session.is_loading());

    // A second send must be possible after the failure.
    assert!(session.send_text("still there?").await.is_ok());
}

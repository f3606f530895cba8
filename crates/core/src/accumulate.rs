//! Folds a provider token stream into monotonically-growing text.
//!
//! Consumers receive the full accumulated buffer after every fragment, never
//! the delta, so state holders can replace wholesale without risking
//! duplicate appends under re-delivery.

use agentcanvas_llm::{ProviderStreamHandle, StreamEventPayload};
use snafu::Snafu;

pub type AccumulateResult = Result<String, AccumulateError>;

#[derive(Debug, Snafu)]
pub enum AccumulateError {
    #[snafu(display("provider stream failed: {message}"))]
    StreamFailed { message: String },
    #[snafu(display("provider stream ended before a terminal event"))]
    MissingTerminalEvent,
}

/// Drives one provider stream to completion, invoking `on_update` with the
/// full buffer after each fragment, in arrival order.
///
/// Resolves with the final full string. On failure the error propagates and
/// whatever was already pushed through `on_update` stays as-is; there is no
/// rollback.
pub async fn accumulate<F>(handle: ProviderStreamHandle, mut on_update: F) -> AccumulateResult
where
    F: FnMut(&str),
{
    let ProviderStreamHandle { mut stream, worker } = handle;
    let worker = tokio::spawn(worker);

    let mut buffer = String::new();
    let mut outcome: Option<AccumulateResult> = None;

    while let Some(event) = stream.recv().await {
        match event.payload {
            StreamEventPayload::Delta(fragment) => {
                buffer.push_str(&fragment);
                on_update(&buffer);
            }
            StreamEventPayload::Done => {
                outcome = Some(Ok(std::mem::take(&mut buffer)));
                break;
            }
            StreamEventPayload::Error(message) => {
                outcome = Some(Err(AccumulateError::StreamFailed { message }));
                break;
            }
        }
    }

    // Dropping the stream above on break signals the worker; reap it so the
    // provider task never outlives the step that started it.
    drop(stream);
    let _ = worker.await;

    outcome.unwrap_or(Err(AccumulateError::MissingTerminalEvent))
}

#[cfg(test)]
mod tests {
    use agentcanvas_llm::{
        ProviderStreamHandle, StreamEvent, StreamEventPayload, StreamSessionId, StreamTarget,
        ThreadEpoch, make_event_stream,
    };

    use super::*;

    fn scripted_handle(payloads: Vec<StreamEventPayload>) -> ProviderStreamHandle {
        let target = StreamTarget::new(ThreadEpoch::new(1), StreamSessionId::new(1));
        let (event_tx, stream, _cancel_rx) = make_event_stream(target);
        for payload in payloads {
            let _ = event_tx.send(StreamEvent { target, payload });
        }
        ProviderStreamHandle {
            stream,
            worker: Box::pin(async {}),
        }
    }

    #[tokio::test]
    async fn every_callback_sees_the_full_prefix() {
        let handle = scripted_handle(vec![
            StreamEventPayload::Delta("fn ".to_string()),
            StreamEventPayload::Delta("main".to_string()),
            StreamEventPayload::Delta("()".to_string()),
            StreamEventPayload::Done,
        ]);

        let mut observed = Vec::new();
        let final_text = accumulate(handle, |full| observed.push(full.to_string()))
            .await
            .expect("scripted stream completes");

        assert_eq!(observed, vec!["fn ", "fn main", "fn main()"]);
        assert_eq!(final_text, "fn main()");
    }

    #[tokio::test]
    async fn errors_propagate_and_keep_pushed_content() {
        let handle = scripted_handle(vec![
            StreamEventPayload::Delta("partial".to_string()),
            StreamEventPayload::Error("remote reset".to_string()),
        ]);

        let mut observed = Vec::new();
        let error = accumulate(handle, |full| observed.push(full.to_string()))
            .await
            .expect_err("scripted stream fails");

        assert!(matches!(error, AccumulateError::StreamFailed { .. }));
        assert_eq!(observed, vec!["partial"]);
    }

    #[tokio::test]
    async fn a_stream_without_terminal_event_is_an_error() {
        let handle = scripted_handle(vec![StreamEventPayload::Delta("x".to_string())]);

        let error = accumulate(handle, |_| {}).await.expect_err("no terminal event");
        assert!(matches!(error, AccumulateError::MissingTerminalEvent));
    }
}

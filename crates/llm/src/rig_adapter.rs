use std::sync::Arc;

use futures::StreamExt;
use rig::OneOrMany;
use rig::completion::{
    AssistantContent, CompletionModel, CompletionRequestBuilder, Message as RigMessage,
};
use rig::http_client::{self, HttpClientExt, NoBody};
use rig::message::UserContent;
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::model::{DEFAULT_MODEL, Model, ModelCache, ModelCatalog, default_fallback_models, get_model_cache};
use super::provider::{
    ApiType, BoxFuture, ChatRequest, CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu,
    ImageGenerationStatusSnafu, LlmProvider, MessageBody, MessagePart, MissingApiKeySnafu,
    ModelFetchStatusSnafu, ModelPayloadParseSnafu, ProviderConfig, ProviderError, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEvent, StreamEventPayload,
    StreamRequest, StreamTarget, make_event_stream,
};

pub const OPENAI_PROVIDER_ID: &str = "openai";
pub const AZURE_PROVIDER_ID: &str = "azure";

/// Image model the generation endpoint is pinned to.
const IMAGE_MODEL: &str = "dall-e-3";
const IMAGE_SIZE: &str = "1024x1024";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// OpenAI-compatible provider adapter built on Rig.
///
/// Azure is handled through endpoint shaping rather than a second adapter:
/// the deployment-independent `/openai/v1` surface accepts the same request
/// shape as the plain OpenAI API.
pub struct RigProviderAdapter {
    config: ProviderConfig,
    fallback_models: Vec<Model>,
    model_cache: Arc<ModelCache>,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self {
            config,
            fallback_models: default_fallback_models(),
            model_cache: get_model_cache(),
        })
    }

    fn effective_endpoint(config: &ProviderConfig) -> String {
        match config.api_type {
            ApiType::OpenAi => config.endpoint.clone(),
            ApiType::Azure => {
                format!("{}/openai/v1", config.endpoint.trim_end_matches('/'))
            }
        }
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        let endpoint = Self::effective_endpoint(config);
        if !endpoint.is_empty() {
            builder = builder.base_url(endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn resolve_model_id(config: &ProviderConfig, requested: &str) -> String {
        let requested = requested.trim();
        if !requested.is_empty() {
            return requested.to_string();
        }

        // Azure callers often configure only the deployment name.
        if matches!(config.api_type, ApiType::Azure) && !config.azure_deployment.is_empty() {
            return config.azure_deployment.clone();
        }

        config
            .default_model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    async fn fetch_models_from_provider(&self) -> ProviderResult<Vec<Model>> {
        let client = Self::build_client(&self.config)?;
        let request = client
            .get("/models")
            .context(HttpClientSnafu {
                stage: "build-model-request",
            })?
            .body(NoBody)
            .map_err(|source| ProviderError::BuildHttpRequestBody {
                stage: "build-model-request-body",
                message: source.to_string(),
            })?;

        let response = client.send(request).await.context(HttpClientSnafu {
            stage: "send-model-request",
        })?;
        let status = response.status();
        let payload = http_client::text(response).await.context(HttpClientSnafu {
            stage: "read-model-response",
        })?;

        if !status.is_success() {
            return ModelFetchStatusSnafu {
                stage: "model-http-status",
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        let model_ids = Self::extract_model_ids(&payload);
        if model_ids.is_empty() {
            return ModelPayloadParseSnafu {
                stage: "parse-model-response",
                details: "no model identifiers found in provider response".to_string(),
            }
            .fail();
        }

        Ok(model_ids.into_iter().map(Model::from_id).collect())
    }

    fn extract_model_ids(payload: &str) -> Vec<String> {
        let mut ids = Vec::new();
        let mut cursor = payload;
        let needle = "\"id\":\"";

        // Listing payloads differ across compatible providers; pulling every
        // OpenAI-style `id` field tolerates all of them.
        while let Some(start) = cursor.find(needle) {
            let tail = &cursor[start + needle.len()..];
            let Some(end) = tail.find('"') else {
                break;
            };

            let candidate = tail[..end].trim();
            if !candidate.is_empty() {
                ids.push(candidate.to_string());
            }
            cursor = &tail[end + 1..];
        }

        ids.sort();
        ids.dedup();
        ids
    }

    fn user_rig_message(message: &ProviderMessage) -> RigMessage {
        match &message.body {
            MessageBody::Text(text) => RigMessage::user(text.clone()),
            MessageBody::Parts(parts) => {
                let content = parts
                    .iter()
                    .map(|part| match part {
                        MessagePart::Text(text) => UserContent::text(text.clone()),
                        MessagePart::ImageUrl(url) => {
                            UserContent::image_url(url.clone(), None, None)
                        }
                    })
                    .collect::<Vec<_>>();

                match OneOrMany::many(content) {
                    Ok(content) => RigMessage::User { content },
                    // An empty part list degrades to the flattened text form.
                    Err(_) => RigMessage::user(message.body.joined_text()),
                }
            }
        }
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(Self::user_rig_message(message)),
            Role::Assistant => Some(RigMessage::assistant(message.body.joined_text())),
        }
    }

    fn merged_preamble(request: &ChatRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig exposes a single preamble field, so system-role messages are folded into it
        // to preserve caller intent while still sending user/assistant turns as chat messages.
        for message in &request.messages {
            if matches!(message.role, Role::System) && !message.body.is_blank() {
                preamble_parts.push(message.body.joined_text());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    fn prepare_messages(
        request: &ChatRequest,
        stage: &'static str,
    ) -> ProviderResult<(Vec<RigMessage>, RigMessage)> {
        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        if messages.is_empty() {
            tracing::warn!(
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot build completion because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu { stage }.fail();
        }

        let Some(prompt) = messages.pop() else {
            return EmptyMessageSetSnafu { stage }.fail();
        };

        Ok((messages, prompt))
    }

    fn apply_request_options<M>(
        mut builder: CompletionRequestBuilder<M>,
        request: &ChatRequest,
    ) -> CompletionRequestBuilder<M>
    where
        M: CompletionModel,
    {
        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &ChatRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(Self::resolve_model_id(config, &request.model_id));

        let (messages, prompt) = Self::prepare_messages(request, "open-stream")?;
        let builder =
            Self::apply_request_options(model.completion_request(prompt).messages(messages), request);

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    async fn run_completion(
        config: &ProviderConfig,
        request: &ChatRequest,
    ) -> ProviderResult<String> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(Self::resolve_model_id(config, &request.model_id));

        let (messages, prompt) = Self::prepare_messages(request, "run-completion")?;
        let builder =
            Self::apply_request_options(model.completion_request(prompt).messages(messages), request);

        let response = builder.send().await.context(CompletionsFailedSnafu {
            stage: "completion-send",
        })?;

        let text = response
            .choice
            .into_iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(text)
    }

    async fn request_image(config: &ProviderConfig, prompt: &str) -> ProviderResult<String> {
        let client = Self::build_client(config)?;

        let payload = serde_json::to_vec(&ImageGenerationRequest {
            model: IMAGE_MODEL,
            prompt,
            n: 1,
            size: IMAGE_SIZE,
            response_format: "url",
        })
        .map_err(|source| ProviderError::ImagePayloadParse {
            stage: "serialize-image-request",
            details: source.to_string(),
        })?;

        let request = client
            .post("/images/generations")
            .context(HttpClientSnafu {
                stage: "build-image-request",
            })?
            .header("Content-Type", "application/json")
            .body(payload)
            .map_err(|source| ProviderError::BuildHttpRequestBody {
                stage: "build-image-request-body",
                message: source.to_string(),
            })?;

        let response = client.send(request).await.context(HttpClientSnafu {
            stage: "send-image-request",
        })?;
        let status = response.status();
        let payload = http_client::text(response).await.context(HttpClientSnafu {
            stage: "read-image-response",
        })?;

        if !status.is_success() {
            return ImageGenerationStatusSnafu {
                stage: "image-http-status",
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        let parsed: ImageGenerationResponse =
            serde_json::from_str(&payload).map_err(|source| ProviderError::ImagePayloadParse {
                stage: "parse-image-response",
                details: source.to_string(),
            })?;

        parsed
            .data
            .into_iter()
            .find_map(|datum| datum.url)
            .filter(|url| !url.is_empty())
            .ok_or(ProviderError::MissingImageUrl {
                stage: "extract-image-url",
            })
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEvent>,
        target: StreamTarget,
        error: ProviderError,
    ) {
        let _ = event_tx.send(StreamEvent {
            target,
            payload: StreamEventPayload::Error(error.to_string()),
        });
    }

    fn map_stream_item<R>(target: StreamTarget, item: StreamedAssistantContent<R>) -> Option<StreamEvent>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) => Some(StreamEvent {
                target,
                payload: StreamEventPayload::Delta(text.text),
            }),
            // Reasoning and tool-call fragments have no place in this
            // completion surface; only visible text reaches consumers.
            _ => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;
        let mut stream = match Self::open_stream(&config, &request.request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    provider_id = %config.provider_id,
                    model_id = %request.request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, target, error);
                return;
            }
        };

        let mut abandoned = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    abandoned = true;
                    // The consumer went away; stop provider IO promptly.
                    tracing::debug!(target = ?target, "provider stream abandoned by consumer");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(target, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, target, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !abandoned && !stream_failed {
            let _ = event_tx.send(StreamEvent {
                target,
                payload: StreamEventPayload::Done,
            });
        }
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        match self.config.api_type {
            ApiType::OpenAi => "OpenAI Compatible",
            ApiType::Azure => "Azure OpenAI",
        }
    }

    fn default_model(&self) -> &str {
        self.config.default_model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    fn fallback_models(&self) -> &[Model] {
        &self.fallback_models
    }

    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
        Box::pin(async move {
            if let Some(models) = self.model_cache.get_fresh(self.id()).await {
                return Ok(ModelCatalog::from_cache_fresh(models));
            }

            // Fallback order intentionally prefers availability over strict freshness:
            // provider API first, then stale cache, then static defaults.
            match self.fetch_models_from_provider().await {
                Ok(models) => {
                    self.model_cache.set(self.id(), models.clone()).await;
                    Ok(ModelCatalog::from_provider_api(models))
                }
                Err(error) => {
                    let error_message = error.to_string();

                    if let Some(models) = self.model_cache.get_any(self.id()).await {
                        tracing::warn!(
                            provider_id = %self.id(),
                            cached_model_count = models.len(),
                            error = %error_message,
                            "model fetch failed; serving stale cached models"
                        );
                        return Ok(ModelCatalog::from_cache_stale(models, error_message));
                    }

                    tracing::warn!(
                        provider_id = %self.id(),
                        fallback_model_count = self.fallback_models.len(),
                        error = %error_message,
                        "model fetch failed without cache; serving static fallback models"
                    );

                    Ok(ModelCatalog::from_static_fallback(
                        self.fallback_models.clone(),
                        error_message,
                    ))
                }
            }
        })
    }

    fn complete<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move { Self::run_completion(&self.config, &request).await })
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }

    fn generate_image<'a>(&'a self, prompt: String) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move { Self::request_image(&self.config, &prompt).await })
    }
}

#[derive(Serialize)]
struct ImageGenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u8,
    size: &'a str,
    response_format: &'a str,
}

#[derive(Deserialize)]
struct ImageGenerationResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Deserialize)]
struct ImageDatum {
    url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_model_ids_handles_openai_listing_shape() {
        let payload = r#"{"data":[{"id":"gpt-4o","object":"model"},{"id":"gpt-4o-mini"},{"id":"gpt-4o"}]}"#;
        let ids = RigProviderAdapter::extract_model_ids(payload);
        assert_eq!(ids, vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()]);
    }

    #[test]
    fn azure_endpoint_is_shaped_to_v1_surface() {
        let config = ProviderConfig::new(
            AZURE_PROVIDER_ID,
            "key",
            "https://unit.openai.azure.com/",
            None,
        )
        .with_azure("unit-gpt4o", "2024-06-01");

        assert_eq!(
            RigProviderAdapter::effective_endpoint(&config),
            "https://unit.openai.azure.com/openai/v1"
        );
    }

    #[test]
    fn model_resolution_prefers_request_then_deployment_then_default() {
        let config = ProviderConfig::new(AZURE_PROVIDER_ID, "key", "https://unit", None)
            .with_azure("unit-gpt4o", "2024-06-01");

        assert_eq!(
            RigProviderAdapter::resolve_model_id(&config, "gpt-4o-mini"),
            "gpt-4o-mini"
        );
        assert_eq!(RigProviderAdapter::resolve_model_id(&config, "  "), "unit-gpt4o");

        let plain = ProviderConfig::new(OPENAI_PROVIDER_ID, "key", "", None);
        assert_eq!(RigProviderAdapter::resolve_model_id(&plain, ""), DEFAULT_MODEL);
    }

    #[test]
    fn system_messages_fold_into_preamble() {
        let request = ChatRequest::new(
            "gpt-4o",
            vec![
                ProviderMessage::text(Role::System, "answer tersely"),
                ProviderMessage::text(Role::User, "hi"),
            ],
        )
        .with_preamble("respond in en-US");

        let preamble = RigProviderAdapter::merged_preamble(&request).expect("non-empty");
        assert!(preamble.contains("respond in en-US"));
        assert!(preamble.contains("answer tersely"));
    }
}

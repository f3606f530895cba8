#![deny(unsafe_code)]

//! Remote completion capability for AgentCanvas: provider configuration, the
//! `LlmProvider` trait, and the Rig-based OpenAI-compatible adapter.

use std::sync::Arc;

mod model;
mod provider;
mod rig_adapter;

pub use model::{
    DEFAULT_MODEL, Model, ModelCache, ModelCatalog, ModelCatalogSource, default_fallback_models,
    get_model_cache,
};
pub use provider::{
    ApiType, BoxFuture, ChatRequest, LlmProvider, MessageBody, MessagePart, ProviderConfig,
    ProviderError, ProviderEventStream, ProviderMessage, ProviderResult, ProviderStreamHandle,
    ProviderWorker, Role, StreamEvent, StreamEventPayload, StreamRequest, StreamSessionId,
    StreamTarget, ThreadEpoch, make_event_stream,
};
pub use rig_adapter::{AZURE_PROVIDER_ID, OPENAI_PROVIDER_ID, RigProviderAdapter};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = match config.api_type {
            ApiType::OpenAi => OPENAI_PROVIDER_ID,
            ApiType::Azure => AZURE_PROVIDER_ID,
        }
        .to_string();
    }

    match config.provider_id.as_str() {
        OPENAI_PROVIDER_ID => Ok(Arc::new(RigProviderAdapter::new(config)?)),
        AZURE_PROVIDER_ID => {
            config.api_type = ApiType::Azure;
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}

pub async fn fetch_models_for_provider(provider: &dyn LlmProvider) -> ProviderResult<ModelCatalog> {
    provider.fetch_models().await
}

//! Model request contract, request pool, and response caching.
//!
//! Everything in the engine talks to a model through [`BoundModel`], which
//! is produced by [`ModelFactory::bind`]. Binding fixes the model settings;
//! every call then:
//! 1. derives a cache key from the full serialized request
//! 2. returns a cached response if there is one
//! 3. otherwise waits for a request-pool slot and calls the provider

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use rowforge_shared::{ContentPart, Message, ModelConfig, Result, RowForgeError};
use rowforge_storage::{KeyValueCache, MODEL_NAMESPACE, cache_key};

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Strict JSON output format attached to a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: Value,
    /// Ask the provider to enforce the schema itself.
    pub strict: bool,
}

/// A single chat-completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    pub generate_images: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    /// Sampling seed; also keeps otherwise identical parallel requests apart in the cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl ModelRequest {
    pub fn new(config: &ModelConfig, messages: Vec<Message>) -> Self {
        Self {
            model: config.model.clone(),
            messages,
            temperature: config.temperature,
            response_format: None,
            reasoning_effort: config.reasoning_effort.clone(),
            generate_images: config.generate_images,
            aspect_ratio: config.aspect_ratio.clone(),
            seed: None,
        }
    }

    /// Constrain the output to `schema`.
    pub fn with_schema(mut self, name: impl Into<String>, schema: Value, strict: bool) -> Self {
        self.response_format = Some(ResponseFormat {
            name: name.into(),
            schema,
            strict,
        });
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Deterministic cache key over every field of the request.
    pub fn cache_key(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)
            .map_err(|e| RowForgeError::parse(format!("failed to serialize request: {e}")))?;
        Ok(cache_key(&canonical))
    }
}

/// What a model returned: optional text plus any generated media.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ContentPart>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            images: Vec::new(),
        }
    }

    /// Non-blank text, if any.
    pub fn content(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.content().is_none() && self.images.is_empty()
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Produces [`BoundModel`]s that share one request pool and cache.
pub struct ModelFactory {
    provider: Arc<dyn ModelProvider>,
    requests: Arc<Semaphore>,
    cache: Option<Arc<dyn KeyValueCache>>,
}

impl ModelFactory {
    /// At most `max_requests` provider calls are in flight at once.
    pub fn new(provider: Arc<dyn ModelProvider>, max_requests: usize) -> Self {
        Self {
            provider,
            requests: Arc::new(Semaphore::new(max_requests.max(1))),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn KeyValueCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn bind(&self, config: &ModelConfig) -> BoundModel {
        BoundModel {
            config: config.clone(),
            provider: self.provider.clone(),
            requests: self.requests.clone(),
            cache: self.cache.clone(),
        }
    }
}

/// A model client with fixed settings.
#[derive(Clone)]
pub struct BoundModel {
    config: ModelConfig,
    provider: Arc<dyn ModelProvider>,
    requests: Arc<Semaphore>,
    cache: Option<Arc<dyn KeyValueCache>>,
}

impl BoundModel {
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Build a request for `messages` with this model's settings.
    pub fn request(&self, messages: Vec<Message>) -> ModelRequest {
        ModelRequest::new(&self.config, messages)
    }

    /// Send a request through the cache and the request pool.
    pub async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let key = request.cache_key()?;

        if let Some(cache) = &self.cache {
            match cache.get(MODEL_NAMESPACE, &key).await {
                Ok(Some(hit)) => match serde_json::from_str::<ModelResponse>(&hit) {
                    Ok(response) => {
                        debug!(model = %request.model, "model cache hit");
                        return Ok(response);
                    }
                    Err(e) => warn!(error = %e, "discarding unreadable model cache entry"),
                },
                Ok(None) => {}
                Err(e) => warn!(error = %e, "model cache lookup failed"),
            }
        }

        let response = {
            let _permit = self
                .requests
                .acquire()
                .await
                .map_err(|e| RowForgeError::Provider(format!("request pool closed: {e}")))?;
            let start = std::time::Instant::now();
            let response = self.provider.complete(request).await?;
            debug!(
                model = %request.model,
                duration_ms = start.elapsed().as_millis(),
                "model call complete"
            );
            response
        };

        if let Some(cache) = &self.cache {
            if !response.is_empty() {
                match serde_json::to_string(&response) {
                    Ok(serialized) => {
                        if let Err(e) = cache.put(MODEL_NAMESPACE, &key, &serialized).await {
                            warn!(error = %e, "failed to store model cache entry");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize model response"),
                }
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;
    use rowforge_storage::MemoryCache;

    fn config(model: &str) -> ModelConfig {
        ModelConfig {
            model: model.into(),
            temperature: None,
            reasoning_effort: None,
            generate_images: false,
            aspect_ratio: None,
        }
    }

    #[test]
    fn cache_key_covers_every_field() {
        let base = ModelRequest::new(&config("a/model"), vec![Message::user_text("hi")]);
        let other_model = ModelRequest::new(&config("b/model"), vec![Message::user_text("hi")]);
        let seeded = base.clone().with_seed(Some(1));
        let with_schema = base
            .clone()
            .with_schema("out", serde_json::json!({"type": "object"}), true);

        let key = base.cache_key().unwrap();
        assert_eq!(key, base.clone().cache_key().unwrap());
        assert_ne!(key, other_model.cache_key().unwrap());
        assert_ne!(key, seeded.cache_key().unwrap());
        assert_ne!(key, with_schema.cache_key().unwrap());
    }

    #[tokio::test]
    async fn cached_response_is_served_without_provider_call() {
        let provider = Arc::new(ScriptedModel::new().push_text("fresh"));
        let cache = Arc::new(MemoryCache::new());
        let factory = ModelFactory::new(provider.clone(), 2).with_cache(cache.clone());
        let model = factory.bind(&config("a/model"));

        let request = model.request(vec![Message::user_text("hello")]);
        let first = model.complete(&request).await.unwrap();
        let second = model.complete(&request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.text.as_deref(), Some("fresh"));
        assert_eq!(provider.call_count(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn empty_responses_are_not_cached() {
        let provider = Arc::new(
            ScriptedModel::new()
                .push(ModelResponse::default())
                .push_text("second"),
        );
        let cache = Arc::new(MemoryCache::new());
        let factory = ModelFactory::new(provider.clone(), 1).with_cache(cache.clone());
        let model = factory.bind(&config("a/model"));
        let request = model.request(vec![Message::user_text("hello")]);

        assert!(model.complete(&request).await.unwrap().is_empty());
        assert_eq!(
            model.complete(&request).await.unwrap().text.as_deref(),
            Some("second")
        );
        assert_eq!(provider.call_count(), 2);
    }

    #[test]
    fn blank_text_counts_as_empty() {
        assert!(ModelResponse::text("  \n").is_empty());
        assert!(!ModelResponse::text("ok").is_empty());
    }
}

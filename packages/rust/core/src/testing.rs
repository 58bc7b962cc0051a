//! Testing utilities including mock implementations.
//!
//! These let pipelines run end to end without real model calls or disk writes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use rowforge_crawler::PageFetcher;
use rowforge_shared::{ModelConfig, Result, RowForgeError};

use crate::artifacts::{ArtifactEvent, ArtifactSink};
use crate::executor::StepServices;
use crate::model::{ModelFactory, ModelProvider, ModelRequest, ModelResponse};
use crate::plugins::{DedupeStore, PluginRegistry};

type Responder = dyn Fn(&ModelRequest) -> Result<ModelResponse> + Send + Sync;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A deterministic model provider.
///
/// Queued responses are replayed first, in order; once the queue is empty the
/// responder closure (if any) answers. Every request is recorded.
#[derive(Default)]
pub struct ScriptedModel {
    queue: Mutex<VecDeque<Result<ModelResponse>>>,
    responder: Option<Box<Responder>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response.
    pub fn push(self, response: ModelResponse) -> Self {
        lock(&self.queue).push_back(Ok(response));
        self
    }

    /// Queue a plain-text response.
    pub fn push_text(self, text: impl Into<String>) -> Self {
        self.push(ModelResponse::text(text))
    }

    /// Queue a failed call.
    pub fn push_error(self, error: RowForgeError) -> Self {
        lock(&self.queue).push_back(Err(error));
        self
    }

    /// Answer requests the queue does not cover.
    pub fn with_responder(
        mut self,
        responder: impl Fn(&ModelRequest) -> Result<ModelResponse> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedModel {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        lock(&self.requests).push(request.clone());

        if let Some(queued) = lock(&self.queue).pop_front() {
            return queued;
        }
        match &self.responder {
            Some(responder) => responder(request),
            None => Err(RowForgeError::Provider("scripted model has no response left".into())),
        }
    }
}

/// Artifact sink that keeps every event in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ArtifactEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ArtifactEvent> {
        lock(&self.events).clone()
    }

    /// `<row-id>/<filename>` for every event, in emission order.
    pub fn paths(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .map(|e| format!("{}/{}", e.row, e.filename))
            .collect()
    }
}

#[async_trait]
impl ArtifactSink for MemorySink {
    async fn emit(&self, event: ArtifactEvent) -> Result<()> {
        lock(&self.events).push(event);
        Ok(())
    }
}

/// Plain text model settings for tests.
pub fn model_config() -> ModelConfig {
    ModelConfig {
        model: "test/model".into(),
        temperature: None,
        reasoning_effort: None,
        generate_images: false,
        aspect_ratio: None,
    }
}

/// Services wired to in-memory collaborators; page visits may reach localhost.
pub fn services(
    provider: Arc<dyn ModelProvider>,
    sink: Arc<dyn ArtifactSink>,
) -> Result<StepServices> {
    Ok(StepServices {
        models: ModelFactory::new(provider, 4),
        pages: PageFetcher::new(4)?.allow_private_hosts(true),
        dedupe: DedupeStore::new(),
        sink,
        registry: PluginRegistry::with_builtins(),
    })
}

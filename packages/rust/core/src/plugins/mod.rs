//! Plugin content-provider protocol.
//!
//! A plugin turns a row into zero or more [`PluginPacket`]s before the step's
//! model call. Each plugin kind implements [`ContentProvider`]:
//! - `resolve_config` renders the raw config's templates against the row
//! - `execute` produces the packets
//!
//! Zero packets drop the row's branch. Packet `data` is routed into the row
//! by the executor, never by the plugin itself.

mod dedupe;
mod validation;
mod web_fetch;
mod website_agent;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use rowforge_crawler::PageFetcher;
use rowforge_shared::{
    ModelConfig, PluginKind, PluginPacket, PluginSpec, Result, Row, RowForgeError, RowId,
};

use crate::artifacts::ArtifactSink;
use crate::model::ModelFactory;

pub use dedupe::{DedupeProvider, DedupeStore};
pub use validation::ValidationProvider;
pub use web_fetch::WebFetchProvider;
pub use website_agent::{AgentConfig, WebsiteAgentProvider};

/// Plugin configuration after templates were rendered against a row.
#[derive(Debug, Clone)]
pub enum ResolvedConfig {
    WebsiteAgent(AgentConfig),
    WebFetch {
        url: String,
        max_chars: usize,
    },
    Validation {
        schema: Value,
        field: Option<String>,
    },
    Dedupe {
        key: String,
    },
}

impl ResolvedConfig {
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::WebsiteAgent(_) => PluginKind::WebsiteAgent,
            Self::WebFetch { .. } => PluginKind::WebFetch,
            Self::Validation { .. } => PluginKind::Validation,
            Self::Dedupe { .. } => PluginKind::Dedupe,
        }
    }
}

/// What a plugin can see and use while executing for one row.
pub struct ExecutionContext<'a> {
    pub row: &'a Row,
    pub row_id: &'a RowId,
    pub step_index: usize,
    /// Instance id (`id` from the pipeline or `step{S}-plugin{P}`).
    pub instance_id: &'a str,
    /// Retry cap inherited from the owning step.
    pub max_retries: u32,
    pub models: &'a ModelFactory,
    pub pages: &'a PageFetcher,
    pub dedupe: &'a DedupeStore,
    /// Where plugin-specific artifacts go (under the row's directory).
    pub sink: &'a dyn ArtifactSink,
}

/// The fixed interface every plugin kind implements.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    fn kind(&self) -> PluginKind;

    /// Render `raw` against `row`; model settings inherit from `inherited`.
    fn resolve_config(
        &self,
        raw: &PluginSpec,
        row: &Row,
        inherited: &ModelConfig,
    ) -> Result<ResolvedConfig>;

    async fn execute(
        &self,
        config: ResolvedConfig,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Vec<PluginPacket>>;
}

/// Error for a config handed to the wrong provider.
pub(crate) fn mismatched(expected: PluginKind, got: PluginKind) -> RowForgeError {
    RowForgeError::config(format!("plugin `{expected}` received a `{got}` config"))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps each plugin kind to its implementation.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    providers: HashMap<PluginKind, Arc<dyn ContentProvider>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in plugin.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WebsiteAgentProvider));
        registry.register(Arc::new(WebFetchProvider));
        registry.register(Arc::new(ValidationProvider));
        registry.register(Arc::new(DedupeProvider));
        registry
    }

    /// Register (or replace) the provider for its kind.
    pub fn register(&mut self, provider: Arc<dyn ContentProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: PluginKind) -> Result<Arc<dyn ContentProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| RowForgeError::config(format!("no plugin registered for `{kind}`")))
    }
}

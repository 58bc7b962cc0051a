//! Pipeline definitions and step resolution.
//!
//! A pipeline file (TOML or JSON) holds master defaults, per-category
//! defaults and an ordered `steps` array. [`resolve_pipeline`] folds the
//! three levels into concrete [`StepConfig`]s: step-specific values win
//! over category defaults, which win over master defaults.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DefaultsConfig;
use crate::error::{Result, RowForgeError};
use crate::types::{
    ContentPart, ModelConfig, ModelSettings, OutputMode, OutputSpec, OutputStrategy,
};

/// Category name used by steps that do not declare one.
pub const MODEL_CATEGORY: &str = "model";

const DEFAULT_CRAWL_BUDGET: usize = 10;
const DEFAULT_CRAWL_BATCH: usize = 3;
const DEFAULT_FETCH_MAX_CHARS: usize = 20_000;

// ---------------------------------------------------------------------------
// Raw definitions (as written in the pipeline file)
// ---------------------------------------------------------------------------

/// Root of a pipeline file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub defaults: MasterDefaults,

    /// Category defaults keyed by plugin tag (`website-agent`, ...) or `model`.
    #[serde(default)]
    pub categories: BTreeMap<String, CategoryDefaults>,

    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// `[defaults]` of a pipeline file. Unset fields fall back to the app config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterDefaults {
    #[serde(flatten)]
    pub model: ModelSettings,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<usize>,
}

/// `[categories.<name>]` of a pipeline file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryDefaults {
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<usize>,
}

/// Prompt content: a plain string or explicit content parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl PromptContent {
    pub fn into_parts(self) -> Vec<ContentPart> {
        match self {
            Self::Text(text) if text.trim().is_empty() => Vec::new(),
            Self::Text(text) => vec![ContentPart::text(text)],
            Self::Parts(parts) => parts,
        }
    }
}

/// One `[[steps]]` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(flatten)]
    pub model: ModelSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<PromptContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<JudgeDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackDefinition>,
    /// Shell command template with a `{{file}}` placeholder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgeDefinition {
    #[serde(flatten)]
    pub model: ModelSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackDefinition {
    #[serde(flatten)]
    pub model: ModelSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub loops: u32,
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

/// Closed set of plugin kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PluginKind {
    WebsiteAgent,
    WebFetch,
    Validation,
    Dedupe,
}

impl PluginKind {
    /// Tag used in pipeline files and category tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebsiteAgent => "website-agent",
            Self::WebFetch => "web-fetch",
            Self::Validation => "validation",
            Self::Dedupe => "dedupe",
        }
    }

    /// Built-in category default, used when the pipeline has no `[categories.<tag>]`.
    pub fn builtin_output(&self) -> OutputSpec {
        match self {
            Self::WebsiteAgent => OutputSpec::mode(OutputMode::Merge),
            Self::WebFetch | Self::Validation | Self::Dedupe => OutputSpec::mode(OutputMode::Ignore),
        }
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a step's `plugins` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Instance id; defaults to `step{S}-plugin{P}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(flatten)]
    pub spec: PluginSpec,
}

/// Raw, unrendered plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PluginSpec {
    WebsiteAgent(WebsiteAgentSpec),
    WebFetch(WebFetchSpec),
    Validation(ValidationSpec),
    Dedupe(DedupeSpec),
}

impl PluginSpec {
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::WebsiteAgent(_) => PluginKind::WebsiteAgent,
            Self::WebFetch(_) => PluginKind::WebFetch,
            Self::Validation(_) => PluginKind::Validation,
            Self::Dedupe(_) => PluginKind::Dedupe,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsiteAgentSpec {
    /// Seed URL template.
    pub url: String,
    /// Strict schema of the final, merged result.
    pub schema: Value,
    /// What to look for, passed to every crawler role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default = "default_budget")]
    pub budget: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub extractor: ModelSettings,
    #[serde(default)]
    pub navigator: ModelSettings,
    #[serde(default)]
    pub merger: ModelSettings,
}

fn default_budget() -> usize {
    DEFAULT_CRAWL_BUDGET
}
fn default_batch_size() -> usize {
    DEFAULT_CRAWL_BATCH
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebFetchSpec {
    /// URL template.
    pub url: String,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

fn default_max_chars() -> usize {
    DEFAULT_FETCH_MAX_CHARS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSpec {
    pub schema: Value,
    /// Validate one field instead of the whole row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeSpec {
    /// Key template, e.g. `{{name}}|{{city}}`.
    pub key: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// A plugin slot after hierarchy resolution (templates still unrendered).
#[derive(Debug, Clone)]
pub struct PluginSlot {
    pub id: String,
    pub spec: PluginSpec,
    pub output: OutputStrategy,
}

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub model: ModelConfig,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    pub model: ModelConfig,
    pub prompt: Option<String>,
    pub loops: u32,
}

/// Fully resolved configuration of one step.
#[derive(Debug, Clone)]
pub struct StepConfig {
    pub index: usize,
    pub name: String,
    pub model: ModelConfig,
    pub system: Vec<ContentPart>,
    pub prompt: Vec<ContentPart>,
    pub schema: Option<Value>,
    pub plugins: Vec<PluginSlot>,
    pub output: OutputStrategy,
    pub candidates: usize,
    pub judge: Option<JudgeConfig>,
    pub feedback: Option<FeedbackConfig>,
    pub verify: Option<String>,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl StepConfig {
    /// A step with neither system nor prompt content makes no model call.
    pub fn has_prompt(&self) -> bool {
        !self.system.is_empty() || !self.prompt.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Three-level lookup: step-specific, then category default, then master default.
pub fn resolve<T>(specific: Option<T>, category: Option<T>, master: T) -> T {
    specific.or(category).unwrap_or(master)
}

/// Field-wise output strategy resolution.
pub fn resolve_output(
    specific: &OutputSpec,
    category: Option<&OutputSpec>,
    master: &OutputSpec,
) -> Result<OutputStrategy> {
    let mode = resolve(
        specific.mode,
        category.and_then(|c| c.mode),
        master.mode.unwrap_or(OutputMode::Ignore),
    );
    let column_name = specific
        .column_name
        .clone()
        .or_else(|| category.and_then(|c| c.column_name.clone()))
        .or_else(|| master.column_name.clone());
    let explode = resolve(
        specific.explode,
        category.and_then(|c| c.explode),
        master.explode.unwrap_or(false),
    );

    if mode == OutputMode::Column && column_name.as_deref().is_none_or(str::is_empty) {
        return Err(RowForgeError::config(
            "output mode `column` requires a column_name",
        ));
    }

    Ok(OutputStrategy {
        mode,
        column_name,
        explode,
    })
}

/// Resolve every step of a pipeline against the app-level defaults.
pub fn resolve_pipeline(
    definition: &PipelineDefinition,
    app_defaults: &DefaultsConfig,
) -> Result<Vec<StepConfig>> {
    if definition.steps.is_empty() {
        return Err(RowForgeError::config("pipeline has no steps"));
    }

    let master = &definition.defaults;
    let master_model = master.model.over(&app_defaults.model_config());
    let master_retries = master.max_retries.unwrap_or(app_defaults.max_retries);
    let master_timeout = master.timeout_secs.unwrap_or(app_defaults.timeout_secs);
    let master_candidates = master.candidates.unwrap_or(app_defaults.candidates);

    definition
        .steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            resolve_step(
                index,
                step,
                definition,
                &master_model,
                master_retries,
                master_timeout,
                master_candidates,
            )
        })
        .collect()
}

fn resolve_step(
    index: usize,
    step: &StepDefinition,
    definition: &PipelineDefinition,
    master_model: &ModelConfig,
    master_retries: u32,
    master_timeout: u64,
    master_candidates: usize,
) -> Result<StepConfig> {
    let category_name = step.category.as_deref().unwrap_or(MODEL_CATEGORY);
    let category = definition.categories.get(category_name);
    let with_step = |e: RowForgeError| match e {
        RowForgeError::Config { message } => {
            RowForgeError::config(format!("step {index}: {message}"))
        }
        other => other,
    };

    let model = step.model.over(master_model);
    let output = resolve_output(
        &step.output,
        category.map(|c| &c.output),
        &definition.defaults.output,
    )
    .map_err(with_step)?;

    let candidates = resolve(
        step.candidates,
        category.and_then(|c| c.candidates),
        master_candidates,
    );
    if candidates == 0 {
        return Err(with_step(RowForgeError::config("candidates must be at least 1")));
    }

    let max_retries = resolve(
        step.max_retries,
        category.and_then(|c| c.max_retries),
        master_retries,
    )
    .max(1);
    let timeout_secs = resolve(
        step.timeout_secs,
        category.and_then(|c| c.timeout_secs),
        master_timeout,
    );

    if let Some(schema) = &step.schema {
        if !schema.is_object() {
            return Err(with_step(RowForgeError::config("schema must be a JSON object")));
        }
    }

    let plugins = step
        .plugins
        .iter()
        .enumerate()
        .map(|(plugin_index, plugin)| {
            let kind = plugin.spec.kind();
            let builtin = kind.builtin_output();
            let category_output = definition
                .categories
                .get(kind.as_str())
                .map(|c| &c.output)
                .unwrap_or(&builtin);
            Ok(PluginSlot {
                id: plugin
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("step{index}-plugin{plugin_index}")),
                spec: plugin.spec.clone(),
                output: resolve_output(
                    &plugin.output,
                    Some(category_output),
                    &definition.defaults.output,
                )
                .map_err(with_step)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(StepConfig {
        index,
        name: step.name.clone().unwrap_or_else(|| format!("step{index}")),
        model: model.clone(),
        system: step.system.clone().map(PromptContent::into_parts).unwrap_or_default(),
        prompt: step.prompt.clone().map(PromptContent::into_parts).unwrap_or_default(),
        schema: step.schema.clone(),
        plugins,
        output,
        candidates,
        judge: step.judge.as_ref().map(|j| JudgeConfig {
            model: j.model.over(&model),
            prompt: j.prompt.clone(),
        }),
        feedback: step.feedback.as_ref().map(|f| FeedbackConfig {
            model: f.model.over(&model),
            prompt: f.prompt.clone(),
            loops: f.loops,
        }),
        verify: step.verify.clone(),
        max_retries,
        timeout: Duration::from_secs(timeout_secs),
    })
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a pipeline definition; `.json` files are parsed as JSON, anything else as TOML.
pub fn load_pipeline(path: &Path) -> Result<PipelineDefinition> {
    let content = std::fs::read_to_string(path).map_err(|e| RowForgeError::io(path, e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&content).map_err(|e| {
            RowForgeError::config(format!("failed to parse {}: {e}", path.display()))
        })
    } else {
        toml::from_str(&content).map_err(|e| {
            RowForgeError::config(format!("failed to parse {}: {e}", path.display()))
        })
    }
}

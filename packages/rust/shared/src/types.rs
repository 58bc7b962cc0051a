//! Core domain types shared by the pipeline engine and its plugins.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of input data: ordered field name → JSON value.
pub type Row = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// RowId
// ---------------------------------------------------------------------------

/// Identity of a row as it flows (and splits) through the pipeline.
///
/// `source` is the index in the input file; `branch` records which element
/// each explode or packet fork chose on the way down.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RowId {
    pub source: usize,
    pub branch: Vec<usize>,
}

impl RowId {
    pub fn new(source: usize) -> Self {
        Self {
            source,
            branch: Vec::new(),
        }
    }

    /// Identity of the `index`-th descendant of this row.
    pub fn child(&self, index: usize) -> Self {
        let mut branch = self.branch.clone();
        branch.push(index);
        Self {
            source: self.source,
            branch,
        }
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)?;
        for b in &self.branch {
            write!(f, ".{b}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Content parts & messages
// ---------------------------------------------------------------------------

/// A typed content block, shared by model requests and artifact persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Remote image referenced by URL.
    ImageUrl { url: String },
    /// Inline image, base64 encoded.
    Image { data: String, mime_type: String },
    /// Inline audio, base64 encoded, with a codec tag such as `wav` or `mp3`.
    Audio { data: String, format: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Chat role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl Message {
    pub fn system(content: Vec<ContentPart>) -> Self {
        Self {
            role: Role::System,
            content,
        }
    }

    pub fn user(content: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentPart::text(text)])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentPart::text(text)],
        }
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ---------------------------------------------------------------------------
// Plugin packets
// ---------------------------------------------------------------------------

/// Output unit of a plugin: structured data plus renderable content blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginPacket {
    pub data: Option<Value>,
    pub content_parts: Vec<ContentPart>,
}

impl PluginPacket {
    /// A packet that lets the row through without contributing anything.
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn new(data: Option<Value>, content_parts: Vec<ContentPart>) -> Self {
        Self {
            data,
            content_parts,
        }
    }
}

// ---------------------------------------------------------------------------
// Output strategy
// ---------------------------------------------------------------------------

/// How a step's (or plugin's) value is persisted into the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Shallow-merge object keys into the row (last write wins).
    Merge,
    /// Assign the value to a named field.
    Column,
    /// Keep the value in history only.
    Ignore,
}

/// Fully resolved output strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputStrategy {
    pub mode: OutputMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
    pub explode: bool,
}

impl Default for OutputStrategy {
    fn default() -> Self {
        Self {
            mode: OutputMode::Ignore,
            column_name: None,
            explode: false,
        }
    }
}

/// Partially specified output strategy, as written at one level of the hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<OutputMode>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "column")]
    pub column_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explode: Option<bool>,
}

impl OutputSpec {
    pub fn mode(mode: OutputMode) -> Self {
        Self {
            mode: Some(mode),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Model settings
// ---------------------------------------------------------------------------

/// Resolved model settings used to bind a model client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    /// Request image output in addition to text.
    #[serde(default)]
    pub generate_images: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
}

/// Partially specified model settings; unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_images: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
}

impl ModelSettings {
    /// Fill unset fields from `base`.
    pub fn over(&self, base: &ModelConfig) -> ModelConfig {
        ModelConfig {
            model: self.model.clone().unwrap_or_else(|| base.model.clone()),
            temperature: self.temperature.or(base.temperature),
            reasoning_effort: self
                .reasoning_effort
                .clone()
                .or_else(|| base.reasoning_effort.clone()),
            generate_images: self.generate_images.unwrap_or(base.generate_images),
            aspect_ratio: self
                .aspect_ratio
                .clone()
                .or_else(|| base.aspect_ratio.clone()),
        }
    }
}

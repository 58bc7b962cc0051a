//! Shared types, error model, and configuration for rowforge.
//!
//! This crate is the foundation depended on by all other rowforge crates.
//! It provides:
//! - [`RowForgeError`]: the unified error type
//! - Domain types ([`Row`], [`ContentPart`], [`Message`], [`PluginPacket`], [`OutputStrategy`])
//! - Configuration ([`AppConfig`], config loading) and pipeline definitions
//!   with step resolution ([`resolve_pipeline`])

pub mod config;
pub mod error;
pub mod pipeline;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheConfig, ConcurrencyConfig, DefaultsConfig, OpenRouterConfig, api_key,
    cache_db_path, config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{FeedbackKind, Result, RowForgeError};
pub use pipeline::{
    DedupeSpec, FeedbackConfig, JudgeConfig, PipelineDefinition, PluginConfig, PluginKind,
    PluginSlot, PluginSpec, StepConfig, StepDefinition, ValidationSpec, WebFetchSpec,
    WebsiteAgentSpec, load_pipeline, resolve, resolve_output, resolve_pipeline,
};
pub use types::{
    ContentPart, Message, ModelConfig, ModelSettings, OutputMode, OutputSpec, OutputStrategy,
    PluginPacket, Role, Row, RowId,
};

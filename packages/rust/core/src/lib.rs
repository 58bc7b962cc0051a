//! Per-row pipeline execution engine for rowforge.
//!
//! Rows flow through ordered steps ([`pipeline`]). Each step runs its plugins
//! and then a generation strategy ([`executor`], [`plugins`], [`strategy`]),
//! with schema-constrained retries ([`querier`]). Results land in the row
//! through the output router ([`output`]).

pub mod artifacts;
pub mod executor;
pub mod model;
pub mod openrouter;
pub mod output;
pub mod pipeline;
pub mod plugins;
pub mod querier;
pub mod schema;
pub mod strategy;
pub mod template;
pub mod testing;
pub mod verify;

pub use artifacts::{ArtifactEvent, ArtifactKind, ArtifactSink, FsArtifactWriter};
pub use executor::{StepOutput, StepServices, execute_step};
pub use model::{BoundModel, ModelFactory, ModelProvider, ModelRequest, ModelResponse};
pub use openrouter::OpenRouterClient;
pub use pipeline::{
    CompletedRow, Pipeline, ProgressReporter, RowFailure, RunReport, SilentProgress,
};
pub use plugins::{ContentProvider, DedupeStore, ExecutionContext, PluginRegistry, ResolvedConfig};
pub use querier::{Querier, QueryOutcome};
pub use strategy::{GenerationContext, GenerationResult};
pub use verify::Verifier;

/// Truncate to at most `max_chars` characters, on a char boundary.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}\n... [truncated]", &text[..end]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo\n... [truncated]");
    }
}

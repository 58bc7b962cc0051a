//! Web-fetch plugin: one page's text as content for the step.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use rowforge_shared::{
    ContentPart, ModelConfig, PluginKind, PluginPacket, PluginSpec, Result, Row, RowForgeError,
};

use super::{ContentProvider, ExecutionContext, ResolvedConfig, mismatched};
use crate::{template, truncate_chars};

pub struct WebFetchProvider;

#[async_trait]
impl ContentProvider for WebFetchProvider {
    fn kind(&self) -> PluginKind {
        PluginKind::WebFetch
    }

    fn resolve_config(
        &self,
        raw: &PluginSpec,
        row: &Row,
        _inherited: &ModelConfig,
    ) -> Result<ResolvedConfig> {
        match raw {
            PluginSpec::WebFetch(spec) => Ok(ResolvedConfig::WebFetch {
                url: template::render(&spec.url, row).trim().to_string(),
                max_chars: spec.max_chars,
            }),
            other => Err(mismatched(self.kind(), other.kind())),
        }
    }

    async fn execute(
        &self,
        config: ResolvedConfig,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Vec<PluginPacket>> {
        let ResolvedConfig::WebFetch { url, max_chars } = config else {
            return Err(mismatched(self.kind(), config.kind()));
        };

        let page = ctx
            .pages
            .visit(&url)
            .await
            .map_err(|e| RowForgeError::plugin(ctx.instance_id, e.to_string()))?;
        debug!(row = %ctx.row_id, %url, chars = page.text.len(), "page fetched");

        let text = truncate_chars(&page.text, max_chars);
        Ok(vec![PluginPacket::new(
            Some(json!({ "url": page.url, "title": page.title })),
            vec![ContentPart::text(format!("Content of {}:\n\n{text}", page.url))],
        )])
    }
}

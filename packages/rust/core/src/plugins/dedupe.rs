//! Dedupe plugin: the first row to render a key passes, later ones are dropped.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use rowforge_shared::{ModelConfig, PluginKind, PluginPacket, PluginSpec, Result, Row};

use super::{ContentProvider, ExecutionContext, ResolvedConfig, mismatched};
use crate::template;

/// Seen-key sets for one pipeline run, keyed by plugin instance id.
#[derive(Debug, Default)]
pub struct DedupeStore {
    seen: Mutex<HashMap<String, HashSet<String>>>,
}

impl DedupeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key` for `instance`; true when it had not been seen before.
    ///
    /// Check and insert happen under one lock, so concurrent rows with the
    /// same key can never both be admitted.
    pub async fn check_and_insert(&self, instance: &str, key: &str) -> bool {
        let mut seen = self.seen.lock().await;
        seen.entry(instance.to_string())
            .or_default()
            .insert(key.to_string())
    }

    /// Forget every key of every instance.
    pub async fn reset(&self) {
        self.seen.lock().await.clear();
    }
}

pub struct DedupeProvider;

#[async_trait]
impl ContentProvider for DedupeProvider {
    fn kind(&self) -> PluginKind {
        PluginKind::Dedupe
    }

    fn resolve_config(
        &self,
        raw: &PluginSpec,
        row: &Row,
        _inherited: &ModelConfig,
    ) -> Result<ResolvedConfig> {
        match raw {
            PluginSpec::Dedupe(spec) => Ok(ResolvedConfig::Dedupe {
                key: template::render(&spec.key, row),
            }),
            other => Err(mismatched(self.kind(), other.kind())),
        }
    }

    async fn execute(
        &self,
        config: ResolvedConfig,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Vec<PluginPacket>> {
        let ResolvedConfig::Dedupe { key } = config else {
            return Err(mismatched(self.kind(), config.kind()));
        };

        if ctx.dedupe.check_and_insert(ctx.instance_id, &key).await {
            Ok(vec![PluginPacket::pass()])
        } else {
            info!(row = %ctx.row_id, instance = ctx.instance_id, %key, "duplicate key, dropping row");
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn keys_are_scoped_per_instance() {
        let store = DedupeStore::new();
        assert!(store.check_and_insert("a", "acme").await);
        assert!(!store.check_and_insert("a", "acme").await);
        assert!(store.check_and_insert("b", "acme").await);

        store.reset().await;
        assert!(store.check_and_insert("a", "acme").await);
    }

    #[tokio::test]
    async fn concurrent_duplicates_admit_exactly_one() {
        let store = Arc::new(DedupeStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.check_and_insert("dedupe", "same-key").await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}

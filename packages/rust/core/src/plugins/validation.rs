//! Validation plugin: rows (or one field) that fail a JSON Schema are dropped.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use rowforge_shared::{ModelConfig, PluginKind, PluginPacket, PluginSpec, Result, Row, RowForgeError};

use super::{ContentProvider, ExecutionContext, ResolvedConfig, mismatched};
use crate::schema;

pub struct ValidationProvider;

#[async_trait]
impl ContentProvider for ValidationProvider {
    fn kind(&self) -> PluginKind {
        PluginKind::Validation
    }

    fn resolve_config(
        &self,
        raw: &PluginSpec,
        _row: &Row,
        _inherited: &ModelConfig,
    ) -> Result<ResolvedConfig> {
        match raw {
            PluginSpec::Validation(spec) => {
                if !spec.schema.is_object() && !spec.schema.is_boolean() {
                    return Err(RowForgeError::config("validation schema must be a JSON object"));
                }
                Ok(ResolvedConfig::Validation {
                    schema: spec.schema.clone(),
                    field: spec.field.clone(),
                })
            }
            other => Err(mismatched(self.kind(), other.kind())),
        }
    }

    async fn execute(
        &self,
        config: ResolvedConfig,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Vec<PluginPacket>> {
        let ResolvedConfig::Validation { schema, field } = config else {
            return Err(mismatched(self.kind(), config.kind()));
        };

        let target = match &field {
            Some(name) => ctx.row.get(name).cloned().unwrap_or(Value::Null),
            None => Value::Object(ctx.row.clone()),
        };

        let errors = schema::validate(&schema, &target);
        if errors.is_empty() {
            return Ok(vec![PluginPacket::pass()]);
        }

        let summary = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        warn!(
            row = %ctx.row_id,
            instance = ctx.instance_id,
            field = field.as_deref().unwrap_or("<row>"),
            errors = %summary,
            "row failed validation, dropping"
        );
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rowforge_shared::{RowId, ValidationSpec};
    use serde_json::json;

    use crate::testing::{self, MemorySink, ScriptedModel};

    async fn run(spec: ValidationSpec, row: Value) -> Result<Vec<PluginPacket>> {
        let services = testing::services(
            Arc::new(ScriptedModel::new()),
            Arc::new(MemorySink::new()),
        )?;
        let Value::Object(row) = row else {
            panic!("rows are objects");
        };
        let row_id = RowId::new(0);
        let ctx = ExecutionContext {
            row: &row,
            row_id: &row_id,
            step_index: 0,
            instance_id: "check",
            max_retries: 1,
            models: &services.models,
            pages: &services.pages,
            dedupe: &services.dedupe,
            sink: services.sink.as_ref(),
        };
        let config = ValidationProvider.resolve_config(
            &PluginSpec::Validation(spec),
            &row,
            &testing::model_config(),
        )?;
        ValidationProvider.execute(config, &ctx).await
    }

    #[tokio::test]
    async fn field_failure_drops_the_row() {
        let spec = ValidationSpec {
            schema: json!({"type": "string", "pattern": "@"}),
            field: Some("email".into()),
        };

        let packets = run(spec.clone(), json!({"email": "ada@example.com"})).await.unwrap();
        assert_eq!(packets, vec![PluginPacket::pass()]);

        assert!(run(spec.clone(), json!({"email": "nope"})).await.unwrap().is_empty());
        assert!(run(spec, json!({"email": 42})).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_field_validates_as_null() {
        let spec = ValidationSpec {
            schema: json!({"type": ["string", "null"]}),
            field: Some("nickname".into()),
        };
        assert_eq!(run(spec, json!({"name": "Ada"})).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn whole_row_is_checked_without_a_field() {
        let spec = ValidationSpec {
            schema: json!({"type": "object", "required": ["name"]}),
            field: None,
        };
        assert_eq!(run(spec.clone(), json!({"name": "Ada"})).await.unwrap().len(), 1);
        assert!(run(spec, json!({"city": "London"})).await.unwrap().is_empty());
    }

    #[test]
    fn non_schema_value_is_a_config_error() {
        let spec = PluginSpec::Validation(ValidationSpec {
            schema: json!("string"),
            field: None,
        });
        let err = ValidationProvider
            .resolve_config(&spec, &Row::new(), &testing::model_config())
            .unwrap_err();
        assert!(err.is_fatal());
    }
}

//! Step executor: runs one step for one row.
//!
//! Plugins run strictly in declared order. Each plugin may keep, drop, or
//! fork the row's branch; packet data is routed through the plugin slot's
//! output strategy and packet content accumulates ahead of the step prompt.
//! Afterwards each surviving branch either runs the generation strategy or,
//! when the step has no prompt, persists the plugin content verbatim.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, instrument};

use rowforge_crawler::PageFetcher;
use rowforge_shared::{ContentPart, Message, PluginSlot, Result, Row, RowForgeError, RowId, StepConfig};

use crate::artifacts::{ArtifactEvent, ArtifactSink};
use crate::model::ModelFactory;
use crate::output;
use crate::plugins::{DedupeStore, ExecutionContext, PluginRegistry};
use crate::strategy::{self, GenerationContext};
use crate::template;

/// Shared collaborators for every step of a run.
pub struct StepServices {
    pub models: ModelFactory,
    pub pages: PageFetcher,
    pub dedupe: DedupeStore,
    pub sink: Arc<dyn ArtifactSink>,
    pub registry: PluginRegistry,
}

/// A row leaving a step, ready for the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub id: RowId,
    pub row: Row,
    pub history: Vec<Message>,
}

/// A row variant produced by the plugin chain.
#[derive(Debug, Clone)]
struct Branch {
    row: Row,
    parts: Vec<ContentPart>,
}

/// Execute `step` for one row. An empty result means the row was dropped.
#[instrument(skip_all, fields(row = %row_id, step = %step.name))]
pub async fn execute_step(
    services: &StepServices,
    step: &StepConfig,
    row_id: &RowId,
    row: &Row,
    history: &[Message],
) -> Result<Vec<StepOutput>> {
    let mut branches = vec![Branch {
        row: row.clone(),
        parts: Vec::new(),
    }];

    for slot in &step.plugins {
        branches = run_plugin(services, step, row_id, slot, branches).await?;
        if branches.is_empty() {
            debug!(plugin = %slot.id, "row dropped by plugin");
            return Ok(Vec::new());
        }
    }

    let forked = branches.len() > 1;
    let outputs = try_join_all(branches.into_iter().enumerate().map(|(i, branch)| {
        let id = if forked { row_id.child(i) } else { row_id.clone() };
        finish_branch(services, step, id, branch, history)
    }))
    .await?;

    Ok(outputs.into_iter().flatten().collect())
}

async fn run_plugin(
    services: &StepServices,
    step: &StepConfig,
    row_id: &RowId,
    slot: &PluginSlot,
    branches: Vec<Branch>,
) -> Result<Vec<Branch>> {
    let provider = services.registry.get(slot.spec.kind())?;
    let mut next = Vec::with_capacity(branches.len());

    for branch in branches {
        let config = provider
            .resolve_config(&slot.spec, &branch.row, &step.model)
            .map_err(|e| plugin_error(slot, e))?;
        let ctx = ExecutionContext {
            row: &branch.row,
            row_id,
            step_index: step.index,
            instance_id: &slot.id,
            max_retries: step.max_retries,
            models: &services.models,
            pages: &services.pages,
            dedupe: &services.dedupe,
            sink: services.sink.as_ref(),
        };
        let packets = provider
            .execute(config, &ctx)
            .await
            .map_err(|e| plugin_error(slot, e))?;
        debug!(plugin = %slot.id, packets = packets.len(), "plugin executed");

        for packet in packets {
            let rows = match &packet.data {
                Some(data) => output::route(&branch.row, data, &slot.output)?,
                None => vec![branch.row.clone()],
            };
            for row in rows {
                let mut parts = branch.parts.clone();
                parts.extend(packet.content_parts.iter().cloned());
                next.push(Branch { row, parts });
            }
        }
    }

    Ok(next)
}

async fn finish_branch(
    services: &StepServices,
    step: &StepConfig,
    id: RowId,
    branch: Branch,
    history: &[Message],
) -> Result<Vec<StepOutput>> {
    if !step.has_prompt() {
        pass_through(services, step, &id, &branch.parts).await?;
        return Ok(vec![StepOutput {
            id,
            row: branch.row,
            history: history.to_vec(),
        }]);
    }

    let system = template::render_parts(&step.system, &branch.row);
    let mut user_parts = branch.parts;
    user_parts.extend(template::render_parts(&step.prompt, &branch.row));
    let user = Message::user(user_parts);

    let ctx = GenerationContext {
        models: &services.models,
        sink: services.sink.as_ref(),
        row_id: &id,
        step,
    };
    let result = strategy::generate(&ctx, &system, history, &user).await?;

    let mut next_history = history.to_vec();
    if !user.content.is_empty() {
        next_history.push(user);
    }
    next_history.push(result.history_message);

    let rows = output::route(&branch.row, &result.column_value, &step.output)?;
    if rows.is_empty() {
        debug!("explode produced no rows");
    }
    let fanned = rows.len() > 1;
    Ok(rows
        .into_iter()
        .enumerate()
        .map(|(j, row)| StepOutput {
            id: if fanned { id.child(j) } else { id.clone() },
            row,
            history: next_history.clone(),
        })
        .collect())
}

/// Persist plugin content as the step's artifacts without calling a model.
async fn pass_through(
    services: &StepServices,
    step: &StepConfig,
    id: &RowId,
    parts: &[ContentPart],
) -> Result<()> {
    for (i, part) in parts.iter().enumerate() {
        let stem = if parts.len() == 1 {
            step.name.clone()
        } else {
            format!("{}_{i}", step.name)
        };
        services
            .sink
            .emit(ArtifactEvent::from_part(id, step.index, &stem, part))
            .await?;
    }
    debug!(blocks = parts.len(), "pass-through step persisted plugin content");
    Ok(())
}

/// Attribute a plugin failure to its instance unless it already is, or is fatal.
fn plugin_error(slot: &PluginSlot, error: RowForgeError) -> RowForgeError {
    match error {
        e @ RowForgeError::Plugin { .. } => e,
        e if e.is_fatal() => e,
        e => RowForgeError::plugin(&slot.id, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use rowforge_shared::{
        DedupeSpec, ModelConfig, OutputMode, OutputStrategy, PluginKind, PluginPacket,
        PluginSpec, ValidationSpec, WebFetchSpec,
    };
    use serde_json::{Value, json};

    use crate::model::ModelResponse;
    use crate::plugins::{ContentProvider, ResolvedConfig};
    use crate::testing::{self, MemorySink, ScriptedModel};

    /// Stands in for the web-fetch kind and returns fixed packets.
    struct StubProvider {
        packets: Result<Vec<PluginPacket>>,
    }

    #[async_trait]
    impl ContentProvider for StubProvider {
        fn kind(&self) -> PluginKind {
            PluginKind::WebFetch
        }

        fn resolve_config(
            &self,
            _raw: &PluginSpec,
            _row: &Row,
            _inherited: &ModelConfig,
        ) -> Result<ResolvedConfig> {
            Ok(ResolvedConfig::WebFetch {
                url: "stub".into(),
                max_chars: 0,
            })
        }

        async fn execute(
            &self,
            _config: ResolvedConfig,
            _ctx: &ExecutionContext<'_>,
        ) -> Result<Vec<PluginPacket>> {
            match &self.packets {
                Ok(packets) => Ok(packets.clone()),
                Err(e) => Err(RowForgeError::Network(e.to_string())),
            }
        }
    }

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    fn step(plugins: Vec<PluginSlot>) -> StepConfig {
        StepConfig {
            index: 0,
            name: "summary".into(),
            model: ModelConfig {
                model: "test/model".into(),
                temperature: None,
                reasoning_effort: None,
                generate_images: false,
                aspect_ratio: None,
            },
            system: Vec::new(),
            prompt: vec![ContentPart::text("Summarize {{name}}")],
            schema: None,
            plugins,
            output: OutputStrategy {
                mode: OutputMode::Column,
                column_name: Some("summary".into()),
                explode: false,
            },
            candidates: 1,
            judge: None,
            feedback: None,
            verify: None,
            max_retries: 2,
            timeout: Duration::ZERO,
        }
    }

    fn slot(id: &str, spec: PluginSpec, mode: OutputMode) -> PluginSlot {
        PluginSlot {
            id: id.into(),
            spec,
            output: OutputStrategy {
                mode,
                column_name: None,
                explode: false,
            },
        }
    }

    fn stub_slot() -> PluginSlot {
        slot(
            "fetch",
            PluginSpec::WebFetch(WebFetchSpec {
                url: "https://example.com".into(),
                max_chars: 100,
            }),
            OutputMode::Merge,
        )
    }

    fn services_with_stub(
        provider: Arc<ScriptedModel>,
        sink: Arc<MemorySink>,
        packets: Result<Vec<PluginPacket>>,
    ) -> StepServices {
        let mut services = testing::services(provider, sink).unwrap();
        services.registry.register(Arc::new(StubProvider { packets }));
        services
    }

    #[tokio::test]
    async fn plugin_content_precedes_prompt() {
        let provider = Arc::new(ScriptedModel::new().push_text("Ada wrote programs."));
        let sink = Arc::new(MemorySink::new());
        let packets = vec![PluginPacket::new(
            None,
            vec![ContentPart::text("Context about Ada")],
        )];
        let services = services_with_stub(provider.clone(), sink, Ok(packets));

        let outputs = execute_step(
            &services,
            &step(vec![stub_slot()]),
            &RowId::new(0),
            &row(json!({"name": "Ada"})),
            &[],
        )
        .await
        .unwrap();

        let request = &provider.requests()[0];
        let user = &request.messages[0];
        assert_eq!(user.content[0].as_text(), Some("Context about Ada"));
        assert_eq!(user.content[1].as_text(), Some("Summarize Ada"));

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].row["summary"], json!("Ada wrote programs."));
        assert_eq!(outputs[0].history.len(), 2);
    }

    #[tokio::test]
    async fn pass_through_persists_content_without_model_call() {
        let provider = Arc::new(ScriptedModel::new());
        let sink = Arc::new(MemorySink::new());
        let packets = vec![PluginPacket::new(
            Some(json!({"title": "Home"})),
            vec![ContentPart::text("one"), ContentPart::text("two")],
        )];
        let services = services_with_stub(provider.clone(), sink.clone(), Ok(packets));
        let mut step = step(vec![stub_slot()]);
        step.prompt.clear();

        let outputs = execute_step(&services, &step, &RowId::new(3), &Row::new(), &[])
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 0);
        assert_eq!(sink.paths(), vec!["3/summary_0.txt", "3/summary_1.txt"]);
        assert_eq!(outputs[0].row["title"], json!("Home"));
        assert!(outputs[0].history.is_empty());
    }

    #[tokio::test]
    async fn single_block_pass_through_has_no_suffix() {
        let provider = Arc::new(ScriptedModel::new());
        let sink = Arc::new(MemorySink::new());
        let packets = vec![PluginPacket::new(None, vec![ContentPart::text("only")])];
        let services = services_with_stub(provider.clone(), sink.clone(), Ok(packets));
        let mut step = step(vec![stub_slot()]);
        step.prompt.clear();

        let outputs = execute_step(&services, &step, &RowId::new(5), &Row::new(), &[])
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 0);
        assert_eq!(sink.paths(), vec!["5/summary.txt"]);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].id.to_string(), "5");
    }

    #[tokio::test]
    async fn multiple_packets_fork_the_row() {
        let provider = Arc::new(ScriptedModel::new().with_responder(|_| {
            Ok(ModelResponse::text("done"))
        }));
        let packets = vec![
            PluginPacket::new(Some(json!({"n": 1})), Vec::new()),
            PluginPacket::new(Some(json!({"n": 2})), Vec::new()),
        ];
        let services = services_with_stub(provider.clone(), Arc::new(MemorySink::new()), Ok(packets));

        let outputs = execute_step(&services, &step(vec![stub_slot()]), &RowId::new(0), &Row::new(), &[])
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 2);
        let ids: Vec<String> = outputs.iter().map(|o| o.id.to_string()).collect();
        assert_eq!(ids, vec!["0.0", "0.1"]);
        assert_eq!(outputs[0].row["n"], json!(1));
        assert_eq!(outputs[1].row["n"], json!(2));
    }

    #[tokio::test]
    async fn plugin_failures_name_the_instance() {
        let services = services_with_stub(
            Arc::new(ScriptedModel::new()),
            Arc::new(MemorySink::new()),
            Err(RowForgeError::Network("connection refused".into())),
        );

        let err = execute_step(&services, &step(vec![stub_slot()]), &RowId::new(0), &Row::new(), &[])
            .await
            .unwrap_err();

        match err {
            RowForgeError::Plugin { plugin, message } => {
                assert_eq!(plugin, "fetch");
                assert!(message.contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failed_validation_drops_row_before_generation() {
        let provider = Arc::new(ScriptedModel::new());
        let services = testing::services(provider.clone(), Arc::new(MemorySink::new())).unwrap();
        let validation = slot(
            "check",
            PluginSpec::Validation(ValidationSpec {
                schema: json!({"type": "object", "required": ["email"]}),
                field: None,
            }),
            OutputMode::Ignore,
        );

        let outputs = execute_step(
            &services,
            &step(vec![validation]),
            &RowId::new(0),
            &row(json!({"name": "Ada"})),
            &[],
        )
        .await
        .unwrap();

        assert!(outputs.is_empty());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn identical_dedupe_keys_keep_first_row_only() {
        let provider = Arc::new(ScriptedModel::new());
        let services = testing::services(provider, Arc::new(MemorySink::new())).unwrap();
        let mut step = step(vec![slot(
            "unique",
            PluginSpec::Dedupe(DedupeSpec {
                key: "{{company}}".into(),
            }),
            OutputMode::Ignore,
        )]);
        step.prompt.clear();

        let first = execute_step(
            &services,
            &step,
            &RowId::new(0),
            &row(json!({"company": "Acme", "n": 1})),
            &[],
        )
        .await
        .unwrap();
        let second = execute_step(
            &services,
            &step,
            &RowId::new(1),
            &row(json!({"company": "Acme", "n": 2})),
            &[],
        )
        .await
        .unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].row["n"], json!(1));
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn exploded_result_fans_out_with_child_ids() {
        let provider = Arc::new(ScriptedModel::new().push_text(r#"["red", "blue"]"#));
        let services = testing::services(provider, Arc::new(MemorySink::new())).unwrap();
        let mut step = step(Vec::new());
        step.schema = Some(json!({"type": "array", "items": {"type": "string"}}));
        step.output = OutputStrategy {
            mode: OutputMode::Column,
            column_name: Some("color".into()),
            explode: true,
        };

        let outputs = execute_step(&services, &step, &RowId::new(2), &Row::new(), &[])
            .await
            .unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].id.to_string(), "2.0");
        assert_eq!(outputs[1].row["color"], json!("blue"));
        assert_eq!(outputs[0].history, outputs[1].history);
    }

    #[tokio::test]
    async fn explode_on_text_result_is_fatal() {
        let provider = Arc::new(ScriptedModel::new().push_text("not a list"));
        let services = testing::services(provider, Arc::new(MemorySink::new())).unwrap();
        let mut step = step(Vec::new());
        step.output.explode = true;

        let err = execute_step(&services, &step, &RowId::new(0), &Row::new(), &[])
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn history_carries_into_next_step() {
        let provider = Arc::new(ScriptedModel::new().push_text("first").push_text("second"));
        let services = testing::services(provider.clone(), Arc::new(MemorySink::new())).unwrap();
        let step = step(Vec::new());

        let one = execute_step(&services, &step, &RowId::new(0), &row(json!({"name": "A"})), &[])
            .await
            .unwrap();
        execute_step(&services, &step, &one[0].id, &one[0].row, &one[0].history)
            .await
            .unwrap();

        let second_request = &provider.requests()[1];
        assert_eq!(second_request.messages.len(), 3);
        assert_eq!(second_request.messages[1].text(), "first");
    }
}

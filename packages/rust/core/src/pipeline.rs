//! Pipeline orchestrator: drives rows through the ordered steps.
//!
//! Work is a set of units `{row, next step}`. Each unit runs as its own task;
//! when it finishes, its outputs become units for the following step (or
//! completed rows after the last one). The task pool bounds how many units
//! run at once, independently of the model request pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use rowforge_shared::{Message, Result, Row, RowForgeError, RowId, StepConfig};

use crate::executor::{StepOutput, StepServices, execute_step};

/// A row that made it through every step.
#[derive(Debug, Clone)]
pub struct CompletedRow {
    pub id: RowId,
    pub row: Row,
    pub history: Vec<Message>,
}

/// A row that failed; siblings are unaffected.
#[derive(Debug, Clone)]
pub struct RowFailure {
    pub id: RowId,
    /// Name of the step that failed.
    pub step: String,
    pub error: String,
}

/// Result of a pipeline run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Completed rows, ordered by id.
    pub completed: Vec<CompletedRow>,
    pub failures: Vec<RowFailure>,
    /// Rows dropped by plugins or by exploding an empty array.
    pub dropped: usize,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called once before any row starts.
    fn started(&self, rows: usize, steps: usize);
    /// Called when a row finishes one step.
    fn step_finished(&self, row: &RowId, step: &str);
    fn row_completed(&self, row: &RowId);
    fn row_dropped(&self, row: &RowId);
    fn row_failed(&self, row: &RowId, error: &RowForgeError);
    /// Called when the run completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn started(&self, _rows: usize, _steps: usize) {}
    fn step_finished(&self, _row: &RowId, _step: &str) {}
    fn row_completed(&self, _row: &RowId) {}
    fn row_dropped(&self, _row: &RowId) {}
    fn row_failed(&self, _row: &RowId, _error: &RowForgeError) {}
    fn done(&self, _report: &RunReport) {}
}

/// One row waiting to run a step.
struct Unit {
    id: RowId,
    row: Row,
    history: Vec<Message>,
    step: usize,
}

/// Ordered steps plus the shared services they run with.
pub struct Pipeline {
    steps: Arc<Vec<StepConfig>>,
    services: Arc<StepServices>,
    tasks: Arc<Semaphore>,
}

impl Pipeline {
    /// At most `max_tasks` units execute at once.
    pub fn new(steps: Vec<StepConfig>, services: Arc<StepServices>, max_tasks: usize) -> Self {
        Self {
            steps: Arc::new(steps),
            services,
            tasks: Arc::new(Semaphore::new(max_tasks.max(1))),
        }
    }

    pub fn steps(&self) -> &[StepConfig] {
        &self.steps
    }

    /// Run every row through every step.
    ///
    /// Row failures are recorded in the report. A fatal error aborts all
    /// in-flight units and is returned.
    #[instrument(skip_all, fields(rows = rows.len(), steps = self.steps.len()))]
    pub async fn run(&self, rows: Vec<Row>, progress: &dyn ProgressReporter) -> Result<RunReport> {
        let start = Instant::now();
        let mut report = RunReport::default();
        self.services.dedupe.reset().await;

        info!("starting pipeline run");
        progress.started(rows.len(), self.steps.len());

        let mut set = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, (RowId, usize)> = HashMap::new();

        for (index, row) in rows.into_iter().enumerate() {
            let unit = Unit {
                id: RowId::new(index),
                row,
                history: Vec::new(),
                step: 0,
            };
            self.dispatch(&mut set, &mut in_flight, &mut report, progress, unit);
        }

        while let Some(joined) = set.join_next_with_id().await {
            let (task, result) = match joined {
                Ok((task, result)) => (task, result),
                Err(e) => (e.id(), Err(RowForgeError::Task(e.to_string()))),
            };
            let Some((id, step)) = in_flight.remove(&task) else {
                continue;
            };
            let step_name = self.steps[step].name.clone();

            match result {
                Ok(outputs) => {
                    progress.step_finished(&id, &step_name);
                    if outputs.is_empty() {
                        debug!(row = %id, step = %step_name, "row dropped");
                        report.dropped += 1;
                        progress.row_dropped(&id);
                    }
                    for StepOutput { id, row, history } in outputs {
                        let unit = Unit {
                            id,
                            row,
                            history,
                            step: step + 1,
                        };
                        self.dispatch(&mut set, &mut in_flight, &mut report, progress, unit);
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(row = %id, step = %step_name, error = %e, "fatal error, aborting run");
                    set.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    error!(row = %id, step = %step_name, error = %e, "row failed");
                    progress.row_failed(&id, &e);
                    report.failures.push(RowFailure {
                        id,
                        step: step_name,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.completed.sort_by(|a, b| a.id.cmp(&b.id));
        report.failures.sort_by(|a, b| a.id.cmp(&b.id));
        report.elapsed = start.elapsed();

        info!(
            completed = report.completed.len(),
            failed = report.failures.len(),
            dropped = report.dropped,
            elapsed_ms = report.elapsed.as_millis(),
            "pipeline run finished"
        );
        progress.done(&report);
        Ok(report)
    }

    /// Spawn `unit`, or record it as completed when no step is left.
    fn dispatch(
        &self,
        set: &mut JoinSet<Result<Vec<StepOutput>>>,
        in_flight: &mut HashMap<tokio::task::Id, (RowId, usize)>,
        report: &mut RunReport,
        progress: &dyn ProgressReporter,
        unit: Unit,
    ) {
        if unit.step >= self.steps.len() {
            progress.row_completed(&unit.id);
            report.completed.push(CompletedRow {
                id: unit.id,
                row: unit.row,
                history: unit.history,
            });
            return;
        }

        let steps = self.steps.clone();
        let services = self.services.clone();
        let tasks = self.tasks.clone();
        let key = (unit.id.clone(), unit.step);

        let handle = set.spawn(async move {
            let _permit = tasks
                .acquire_owned()
                .await
                .map_err(|e| RowForgeError::Task(format!("task pool closed: {e}")))?;
            let step = &steps[unit.step];
            run_unit(&services, step, &unit).await
        });
        in_flight.insert(handle.id(), key);
    }
}

/// Execute one step for one unit, bounded by the step timeout (zero disables it).
async fn run_unit(services: &StepServices, step: &StepConfig, unit: &Unit) -> Result<Vec<StepOutput>> {
    let attempt = execute_step(services, step, &unit.id, &unit.row, &unit.history);
    if step.timeout.is_zero() {
        return attempt.await;
    }
    tokio::time::timeout(step.timeout, attempt)
        .await
        .map_err(|_| RowForgeError::Timeout {
            step: step.index,
            seconds: step.timeout.as_secs(),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use rowforge_shared::{
        ContentPart, ModelConfig, OutputMode, OutputStrategy, PluginSlot, PluginSpec, ValidationSpec,
        WebFetchSpec,
    };
    use serde_json::{Value, json};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::model::ModelResponse;
    use crate::testing::{self, MemorySink, ScriptedModel};

    fn model() -> ModelConfig {
        ModelConfig {
            model: "test/model".into(),
            temperature: None,
            reasoning_effort: None,
            generate_images: false,
            aspect_ratio: None,
        }
    }

    fn step(index: usize, prompt: &str, output: OutputStrategy) -> StepConfig {
        StepConfig {
            index,
            name: format!("step{index}"),
            model: model(),
            system: Vec::new(),
            prompt: vec![ContentPart::text(prompt)],
            schema: None,
            plugins: Vec::new(),
            output,
            candidates: 1,
            judge: None,
            feedback: None,
            verify: None,
            max_retries: 2,
            timeout: Duration::ZERO,
        }
    }

    fn column(name: &str) -> OutputStrategy {
        OutputStrategy {
            mode: OutputMode::Column,
            column_name: Some(name.into()),
            explode: false,
        }
    }

    fn rows(values: Vec<Value>) -> Vec<Row> {
        values
            .into_iter()
            .map(|v| match v {
                Value::Object(map) => map,
                _ => panic!("rows must be objects"),
            })
            .collect()
    }

    fn pipeline(provider: Arc<ScriptedModel>, steps: Vec<StepConfig>) -> Pipeline {
        let services = testing::services(provider, Arc::new(MemorySink::new())).unwrap();
        Pipeline::new(steps, Arc::new(services), 2)
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ProgressReporter for Recorder {
        fn started(&self, rows: usize, steps: usize) {
            self.events.lock().unwrap().push(format!("started {rows}x{steps}"));
        }
        fn step_finished(&self, _row: &RowId, _step: &str) {}
        fn row_completed(&self, row: &RowId) {
            self.events.lock().unwrap().push(format!("completed {row}"));
        }
        fn row_dropped(&self, row: &RowId) {
            self.events.lock().unwrap().push(format!("dropped {row}"));
        }
        fn row_failed(&self, row: &RowId, _error: &RowForgeError) {
            self.events.lock().unwrap().push(format!("failed {row}"));
        }
        fn done(&self, _report: &RunReport) {
            self.events.lock().unwrap().push("done".into());
        }
    }

    #[tokio::test]
    async fn rows_flow_through_steps_in_order() {
        let provider = Arc::new(ScriptedModel::new().with_responder(|request| {
            let last = request.messages.last().map(|m| m.text()).unwrap_or_default();
            Ok(ModelResponse::text(format!("re: {last}")))
        }));
        let steps = vec![
            step(0, "Describe {{name}}", column("description")),
            step(1, "Shorten it", column("short")),
        ];

        let report = pipeline(provider, steps)
            .run(rows(vec![json!({"name": "Ada"}), json!({"name": "Grace"})]), &SilentProgress)
            .await
            .unwrap();

        assert!(report.succeeded());
        assert_eq!(report.completed.len(), 2);
        let ada = &report.completed[0];
        assert_eq!(ada.id, RowId::new(0));
        assert_eq!(ada.row["description"], json!("re: Describe Ada"));
        assert_eq!(ada.row["short"], json!("re: Shorten it"));
        assert_eq!(ada.history.len(), 4);
    }

    #[tokio::test]
    async fn later_merge_overwrites_earlier_keys() {
        let provider = Arc::new(
            ScriptedModel::new()
                .push_text(r#"{"a": 1, "b": "kept"}"#)
                .push_text(r#"{"a": 2}"#),
        );
        let merge = OutputStrategy {
            mode: OutputMode::Merge,
            column_name: None,
            explode: false,
        };
        let mut first = step(0, "First pass on {{name}}", merge.clone());
        first.schema = Some(json!({"type": "object"}));
        let mut second = step(1, "Second pass", merge);
        second.schema = Some(json!({"type": "object"}));

        let report = pipeline(provider, vec![first, second])
            .run(rows(vec![json!({"name": "Ada"})]), &SilentProgress)
            .await
            .unwrap();

        assert!(report.succeeded());
        let row = &report.completed[0].row;
        assert_eq!(row["a"], json!(2));
        assert_eq!(row["b"], json!("kept"));
        assert_eq!(row["name"], json!("Ada"));
    }

    #[tokio::test]
    async fn explode_fans_out_and_empty_array_drops() {
        let provider = Arc::new(ScriptedModel::new().with_responder(|request| {
            let prompt = request.messages.last().map(|m| m.text()).unwrap_or_default();
            let text = if prompt.contains("none") { "[]" } else { r#"["a", "b", "c"]"# };
            Ok(ModelResponse::text(text))
        }));
        let mut split = step(
            0,
            "List items for {{kind}}",
            OutputStrategy {
                mode: OutputMode::Column,
                column_name: Some("item".into()),
                explode: true,
            },
        );
        split.schema = Some(json!({"type": "array", "items": {"type": "string"}}));
        let recorder = Recorder::default();

        let report = pipeline(provider, vec![split])
            .run(rows(vec![json!({"kind": "some"}), json!({"kind": "none"})]), &recorder)
            .await
            .unwrap();

        assert_eq!(report.completed.len(), 3);
        assert_eq!(report.dropped, 1);
        let ids: Vec<String> = report.completed.iter().map(|c| c.id.to_string()).collect();
        assert_eq!(ids, vec!["0.0", "0.1", "0.2"]);
        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.first().map(String::as_str), Some("started 2x1"));
        assert!(events.contains(&"dropped 1".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("done"));
    }

    #[tokio::test]
    async fn failing_row_does_not_stop_siblings() {
        let provider = Arc::new(ScriptedModel::new().with_responder(|request| {
            let prompt = request.messages.last().map(|m| m.text()).unwrap_or_default();
            if prompt.contains("bad") {
                Err(RowForgeError::Provider("HTTP 500".into()))
            } else {
                Ok(ModelResponse::text("fine"))
            }
        }));
        let steps = vec![step(0, "Handle {{name}}", column("out"))];

        let report = pipeline(provider, steps)
            .run(rows(vec![json!({"name": "bad"}), json!({"name": "good"})]), &SilentProgress)
            .await
            .unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, RowId::new(0));
        assert_eq!(report.failures[0].step, "step0");
        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.completed[0].row["out"], json!("fine"));
    }

    #[tokio::test]
    async fn fatal_error_aborts_the_run() {
        let provider = Arc::new(ScriptedModel::new().with_responder(|_| Ok(ModelResponse::text("plain"))));
        let mut exploding = step(0, "Go", column("out"));
        exploding.output.explode = true;

        let err = pipeline(provider, vec![exploding])
            .run(rows(vec![json!({}), json!({})]), &SilentProgress)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn step_timeout_fails_the_row() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html><body><p>slow</p></body></html>", "text/html")
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let provider = Arc::new(ScriptedModel::new().with_responder(|_| Ok(ModelResponse::text("late"))));
        let mut slow = step(0, "Go", column("out"));
        slow.plugins = vec![PluginSlot {
            id: "fetch".into(),
            spec: PluginSpec::WebFetch(WebFetchSpec {
                url: server.uri(),
                max_chars: 1_000,
            }),
            output: OutputStrategy::default(),
        }];
        slow.timeout = Duration::from_millis(50);

        let report = pipeline(provider.clone(), vec![slow])
            .run(rows(vec![json!({})]), &SilentProgress)
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("timed out"));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn rows_dropped_by_plugins_are_counted() {
        let provider = Arc::new(ScriptedModel::new().with_responder(|_| Ok(ModelResponse::text("ok"))));
        let mut gated = step(0, "Go", column("out"));
        gated.plugins = vec![PluginSlot {
            id: "needs-email".into(),
            spec: PluginSpec::Validation(ValidationSpec {
                schema: json!({"type": "string", "minLength": 3}),
                field: Some("email".into()),
            }),
            output: OutputStrategy::default(),
        }];

        let report = pipeline(provider.clone(), vec![gated])
            .run(
                rows(vec![json!({"email": "ada@example.com"}), json!({"email": null})]),
                &SilentProgress,
            )
            .await
            .unwrap();

        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn empty_pipeline_completes_rows_unchanged() {
        let report = pipeline(Arc::new(ScriptedModel::new()), Vec::new())
            .run(rows(vec![json!({"a": 1})]), &SilentProgress)
            .await
            .unwrap();

        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.completed[0].row["a"], json!(1));
    }
}

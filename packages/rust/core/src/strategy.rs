//! Generation strategies.
//!
//! - **standard**: one request (through the retry querier when the step has a
//!   schema or a verification command)
//! - **candidates + judge**: K standard generations in parallel, a judge model
//!   picks the canonical one (candidate 0 without a judge)
//! - **feedback loop**: a critic reviews the canonical result and the step
//!   regenerates, a fixed number of times
//!
//! Strategies compose: candidates are generated first, then the feedback loop
//! refines the winner. The final result is emitted as the step's artifact.

use futures::future::try_join_all;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use rowforge_shared::{
    ContentPart, FeedbackKind, Message, Result, RowForgeError, RowId, StepConfig,
};

use crate::artifacts::{ArtifactEvent, ArtifactSink};
use crate::model::{BoundModel, ModelFactory};
use crate::querier::Querier;
use crate::verify::Verifier;

/// Assistant history text for a response that only carried media.
pub const MEDIA_PLACEHOLDER: &str = "media generated";

const DEFAULT_JUDGE_PROMPT: &str = "You compare several candidate outputs produced for the \
     same task and pick the one that best fulfils the instructions.";

const DEFAULT_FEEDBACK_PROMPT: &str = "You review an output against the instructions that \
     produced it. List concrete problems and how to fix them. Do not rewrite the output.";

/// Collaborators a strategy needs for one step of one row.
pub struct GenerationContext<'a> {
    pub models: &'a ModelFactory,
    pub sink: &'a dyn ArtifactSink,
    pub row_id: &'a RowId,
    pub step: &'a StepConfig,
}

/// The outcome of a step's generation.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Assistant entry appended to the row's history.
    pub history_message: Message,
    /// Parsed JSON in schema mode, the text otherwise, `null` for media only.
    pub raw_result: Value,
    /// What the output router persists.
    pub column_value: Value,
}

/// One standard generation before it is persisted.
#[derive(Debug, Clone)]
struct Generated {
    text: Option<String>,
    value: Value,
    images: Vec<ContentPart>,
}

impl Generated {
    fn history_text(&self) -> String {
        self.text
            .clone()
            .unwrap_or_else(|| MEDIA_PLACEHOLDER.to_string())
    }

    /// Candidate rendering shown to a judge or critic.
    fn parts(&self, label: &str) -> Vec<ContentPart> {
        let mut parts = vec![ContentPart::text(format!("{label}:\n{}", self.history_text()))];
        parts.extend(self.images.iter().cloned());
        parts
    }
}

/// Run the step's strategy for one row.
///
/// `system` and `user` are already rendered; `history` is the row's
/// accumulated conversation from earlier steps.
#[instrument(skip_all, fields(row = %ctx.row_id, step = %ctx.step.name))]
pub async fn generate(
    ctx: &GenerationContext<'_>,
    system: &[ContentPart],
    history: &[Message],
    user: &Message,
) -> Result<GenerationResult> {
    let step = ctx.step;
    let model = ctx.models.bind(&step.model);
    let verifier = step.verify.as_deref().map(Verifier::new);

    let mut conversation = history.to_vec();
    if !user.content.is_empty() {
        conversation.push(user.clone());
    }

    let mut current = if step.candidates > 1 {
        candidates(ctx, &model, verifier.as_ref(), system, &conversation, user).await?
    } else {
        standard(ctx, &model, verifier.as_ref(), system, &conversation, None).await?
    };

    if let Some(feedback) = step.feedback.as_ref().filter(|f| f.loops > 0) {
        let critic = ctx.models.bind(&feedback.model);
        let critic_prompt = feedback.prompt.as_deref().unwrap_or(DEFAULT_FEEDBACK_PROMPT);

        for round in 0..feedback.loops {
            emit(ctx, &format!("{}_round_{round}", step.name), &current).await?;

            let critique = critique(step, &critic, critic_prompt, user, &current).await?;
            debug!(round, "critique received");

            conversation.push(Message::assistant_text(current.history_text()));
            conversation.push(Message::user_text(format!(
                "Feedback on your previous answer:\n{critique}\n\n\
                 Produce a revised answer that addresses this feedback."
            )));
            current = standard(ctx, &model, verifier.as_ref(), system, &conversation, None).await?;
        }
        info!(loops = feedback.loops, "feedback loop finished");
    }

    let files = emit(ctx, &step.name, &current).await?;
    let column_value = match (&current.text, files.first()) {
        (None, Some(first)) => Value::String(first.clone()),
        _ => current.value.clone(),
    };

    Ok(GenerationResult {
        history_message: Message::assistant_text(current.history_text()),
        raw_result: current.value,
        column_value,
    })
}

/// One request built from system + history + user content.
async fn standard(
    ctx: &GenerationContext<'_>,
    model: &BoundModel,
    verifier: Option<&Verifier>,
    system: &[ContentPart],
    conversation: &[Message],
    seed: Option<u64>,
) -> Result<Generated> {
    let step = ctx.step;

    if step.schema.is_some() || verifier.is_some() {
        let mut querier = Querier::new(model, step.max_retries)
            .with_verifier(verifier)
            .with_seed(seed);
        if let Some(schema) = &step.schema {
            querier = querier.with_schema("step_output", schema);
        }
        let outcome = querier.run(system, conversation).await?;
        return Ok(Generated {
            text: Some(outcome.text),
            value: outcome.value,
            images: outcome.response.images,
        });
    }

    let mut messages = Vec::with_capacity(conversation.len() + 1);
    if !system.is_empty() {
        messages.push(Message::system(system.to_vec()));
    }
    messages.extend_from_slice(conversation);

    let request = model.request(messages).with_seed(seed);
    let response = model.complete(&request).await?;
    if response.is_empty() {
        return Err(RowForgeError::ModelResponse {
            attempts: 1,
            kind: FeedbackKind::NoResponse,
            feedback: "the model returned neither text nor media".into(),
        });
    }

    let text = response.content().map(str::to_string);
    Ok(Generated {
        value: text.clone().map(Value::String).unwrap_or(Value::Null),
        text,
        images: response.images,
    })
}

/// K parallel generations; the judge (or index 0) picks the canonical one.
async fn candidates(
    ctx: &GenerationContext<'_>,
    model: &BoundModel,
    verifier: Option<&Verifier>,
    system: &[ContentPart],
    conversation: &[Message],
    user: &Message,
) -> Result<Generated> {
    let step = ctx.step;
    let count = step.candidates;

    let generated = try_join_all(
        (0..count).map(|i| standard(ctx, model, verifier, system, conversation, Some(i as u64))),
    )
    .await?;

    for (i, candidate) in generated.iter().enumerate() {
        emit(ctx, &format!("{}_candidate_{i}", step.name), candidate).await?;
    }

    let index = match &step.judge {
        Some(judge) => {
            let judge_model = ctx.models.bind(&judge.model);
            let prompt = judge.prompt.as_deref().unwrap_or(DEFAULT_JUDGE_PROMPT);
            pick(step, &judge_model, prompt, user, &generated).await?
        }
        None => 0,
    };
    info!(candidates = count, chosen = index, "canonical candidate selected");

    generated
        .into_iter()
        .nth(index)
        .ok_or_else(|| RowForgeError::config(format!("candidate {index} does not exist")))
}

async fn pick(
    step: &StepConfig,
    judge: &BoundModel,
    prompt: &str,
    user: &Message,
    candidates: &[Generated],
) -> Result<usize> {
    let schema = json!({
        "type": "object",
        "properties": {"best_candidate_index": {"type": "integer"}},
        "required": ["best_candidate_index"]
    });

    let mut content = vec![ContentPart::text(format!(
        "Instructions given to every candidate:\n{}\n\nReturn the zero-based index of the best candidate.",
        user.text()
    ))];
    for (i, candidate) in candidates.iter().enumerate() {
        content.extend(candidate.parts(&format!("Candidate {i}")));
    }

    let outcome = Querier::new(judge, step.max_retries)
        .with_schema("judge", &schema)
        .run(&[ContentPart::text(prompt)], &[Message::user(content)])
        .await?;

    match outcome.value.get("best_candidate_index").and_then(whole_index) {
        Some(index) if index < candidates.len() => Ok(index),
        _ => Err(RowForgeError::config(format!(
            "judge chose candidate {} but only indices 0..{} exist",
            outcome.value["best_candidate_index"],
            candidates.len()
        ))),
    }
}

/// Accept integral indices, including whole-number floats such as `1.0`.
fn whole_index(value: &Value) -> Option<usize> {
    value
        .as_u64()
        .or_else(|| {
            value
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                .map(|f| f as u64)
        })
        .and_then(|index| usize::try_from(index).ok())
}

async fn critique(
    step: &StepConfig,
    critic: &BoundModel,
    prompt: &str,
    user: &Message,
    current: &Generated,
) -> Result<String> {
    let mut content = vec![ContentPart::text(format!(
        "Instructions:\n{}",
        user.text()
    ))];
    content.extend(current.parts("Output"));

    let outcome = Querier::new(critic, step.max_retries)
        .run(&[ContentPart::text(prompt)], &[Message::user(content)])
        .await?;
    Ok(outcome.text)
}

/// Emit a generation under `stem`; returns the media file names.
async fn emit(ctx: &GenerationContext<'_>, stem: &str, generated: &Generated) -> Result<Vec<String>> {
    let row = ctx.row_id;
    let step = ctx.step.index;

    if let Some(text) = &generated.text {
        let event = if ctx.step.schema.is_some() {
            ArtifactEvent::json(row, step, stem, &generated.value)
        } else {
            ArtifactEvent::text(row, step, stem, text.clone())
        };
        ctx.sink.emit(event).await?;
    }

    let mut files = Vec::with_capacity(generated.images.len());
    for (i, image) in generated.images.iter().enumerate() {
        let name = if generated.images.len() == 1 {
            stem.to_string()
        } else {
            format!("{stem}_{i}")
        };
        let event = ArtifactEvent::from_part(row, step, &name, image);
        files.push(event.filename.clone());
        ctx.sink.emit(event).await?;
    }
    Ok(files)
}

//! Schema-constrained retry querier.
//!
//! Each attempt sends the conversation with a system preamble. The preamble
//! carries the schema and strict-format instructions, plus the feedback from
//! the previous failed attempt. Responses are parsed (tolerating code fences),
//! validated, and optionally checked by an external [`Verifier`]. After
//! `max_retries` failed attempts the last feedback is raised as
//! [`RowForgeError::ModelResponse`].

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use rowforge_shared::{ContentPart, FeedbackKind, Message, Result, RowForgeError};

use crate::model::{BoundModel, ModelResponse};
use crate::schema::{self, FieldError};
use crate::verify::Verifier;

/// Why an attempt was rejected, phrased for the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub kind: FeedbackKind,
    pub message: String,
}

impl Feedback {
    fn new(kind: FeedbackKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn schema_violation(errors: &[FieldError]) -> Self {
        let lines = errors
            .iter()
            .map(|e| format!("- {e}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self::new(
            FeedbackKind::SchemaViolation,
            format!("The JSON did not match the schema:\n{lines}"),
        )
    }
}

/// A validated result.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// Parsed JSON in schema mode, the raw text as a JSON string otherwise.
    pub value: Value,
    /// Serialized form used as the assistant history entry.
    pub text: String,
    pub response: ModelResponse,
    pub attempts: u32,
}

/// Retry loop around one bound model.
pub struct Querier<'a> {
    model: &'a BoundModel,
    schema: Option<&'a Value>,
    schema_name: String,
    strict: bool,
    verifier: Option<&'a Verifier>,
    max_retries: u32,
    seed: Option<u64>,
}

impl<'a> Querier<'a> {
    pub fn new(model: &'a BoundModel, max_retries: u32) -> Self {
        Self {
            model,
            schema: None,
            schema_name: "response".into(),
            strict: true,
            verifier: None,
            max_retries: max_retries.max(1),
            seed: None,
        }
    }

    pub fn with_schema(mut self, name: impl Into<String>, schema: &'a Value) -> Self {
        self.schema_name = name.into();
        self.schema = Some(schema);
        self
    }

    /// Let the provider accept output the schema would reject (relaxed schemas).
    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }

    pub fn with_verifier(mut self, verifier: Option<&'a Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Run attempts until one passes or the retry cap is reached.
    #[instrument(skip_all, fields(model = %self.model.config().model, schema = %self.schema_name))]
    pub async fn run(&self, system: &[ContentPart], conversation: &[Message]) -> Result<QueryOutcome> {
        let mut feedback: Option<Feedback> = None;

        for attempt in 1..=self.max_retries {
            let messages = self.messages(system, conversation, feedback.as_ref());
            match self.attempt(messages).await? {
                Ok((value, text, response)) => {
                    debug!(attempt, "response accepted");
                    return Ok(QueryOutcome {
                        value,
                        text,
                        response,
                        attempts: attempt,
                    });
                }
                Err(rejected) => {
                    warn!(
                        attempt,
                        max = self.max_retries,
                        kind = %rejected.kind,
                        "response rejected"
                    );
                    feedback = Some(rejected);
                }
            }
        }

        let last = feedback.unwrap_or_else(|| Feedback::new(FeedbackKind::NoResponse, ""));
        Err(RowForgeError::ModelResponse {
            attempts: self.max_retries,
            kind: last.kind,
            feedback: last.message,
        })
    }

    /// One attempt. The outer `Result` carries errors that must not be retried.
    async fn attempt(
        &self,
        messages: Vec<Message>,
    ) -> Result<std::result::Result<(Value, String, ModelResponse), Feedback>> {
        let mut request = self.model.request(messages).with_seed(self.seed);
        if let Some(schema) = self.schema {
            request = request.with_schema(&self.schema_name, schema.clone(), self.strict);
        }

        let response = match self.model.complete(&request).await {
            Ok(response) => response,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                return Ok(Err(Feedback::new(
                    FeedbackKind::Exception,
                    format!("The request failed: {e}"),
                )));
            }
        };

        let Some(text) = response.content().map(str::to_string) else {
            return Ok(Err(Feedback::new(
                FeedbackKind::NoResponse,
                "The previous response was empty. Answer with the requested content.",
            )));
        };

        let (value, serialized, extension) = match self.schema {
            Some(schema) => {
                let value = match parse_json_response(&text) {
                    Ok(value) => value,
                    Err(e) => {
                        return Ok(Err(Feedback::new(
                            FeedbackKind::ParseError,
                            format!("The response was not valid JSON: {e}"),
                        )));
                    }
                };
                let errors = schema::validate(schema, &value);
                if !errors.is_empty() {
                    return Ok(Err(Feedback::schema_violation(&errors)));
                }
                let serialized = value.to_string();
                (value, serialized, "json")
            }
            None => (Value::String(text.clone()), text, "txt"),
        };

        if let Some(verifier) = self.verifier {
            match verifier.check(&serialized, extension).await {
                Ok(None) => {}
                Ok(Some(failure)) => {
                    return Ok(Err(Feedback::new(
                        FeedbackKind::VerificationFailed,
                        failure.to_string(),
                    )));
                }
                Err(e) => {
                    return Ok(Err(Feedback::new(
                        FeedbackKind::Exception,
                        format!("Verification could not run: {e}"),
                    )));
                }
            }
        }

        Ok(Ok((value, serialized, response)))
    }

    fn messages(
        &self,
        system: &[ContentPart],
        conversation: &[Message],
        feedback: Option<&Feedback>,
    ) -> Vec<Message> {
        let mut preamble = system.to_vec();

        if let Some(schema) = self.schema {
            let pretty = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
            preamble.push(ContentPart::text(format!(
                "Respond with a single JSON value that conforms to this JSON Schema. \
                 Output only the JSON, with no commentary and no code fences.\n\n{pretty}"
            )));
        }
        if let Some(feedback) = feedback {
            preamble.push(ContentPart::text(format!(
                "Your previous response was rejected ({}).\n{}\nCorrect the problem and answer again.",
                feedback.kind, feedback.message
            )));
        }

        let mut messages = Vec::with_capacity(conversation.len() + 1);
        if !preamble.is_empty() {
            messages.push(Message::system(preamble));
        }
        messages.extend_from_slice(conversation);
        messages
    }
}

/// Parse model output as JSON, tolerating Markdown fences and surrounding prose.
pub fn parse_json_response(text: &str) -> std::result::Result<Value, String> {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*\n?(.*?)\s*```").expect("valid regex")
    });

    let trimmed = text.trim();
    let unfenced = FENCE_RE
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    match serde_json::from_str(unfenced) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            // Fall back to the outermost {...} or [...] span
            let start = unfenced.find(['{', '[']);
            let end = unfenced.rfind(['}', ']']);
            match (start, end) {
                (Some(s), Some(e)) if e > s => {
                    serde_json::from_str(&unfenced[s..=e]).map_err(|_| first_err.to_string())
                }
                _ => Err(first_err.to_string()),
            }
        }
    }
}

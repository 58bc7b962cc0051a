//! OpenRouter chat-completion provider.
//!
//! Speaks the OpenAI-compatible `/chat/completions` dialect with OpenRouter's
//! extensions for reasoning effort and image generation.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use rowforge_shared::{AppConfig, ContentPart, Message, Result, Role, RowForgeError, api_key};

use crate::model::{ModelProvider, ModelRequest, ModelResponse};

/// OpenRouter API client.
#[derive(Clone)]
pub struct OpenRouterClient {
    http_client: Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Build from app config; the key is read from the configured env var.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new(api_key(config)?, config.openrouter.base_url.clone()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ModelProvider for OpenRouterClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let body = request_body(request);

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "OpenRouter request failed");
                RowForgeError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "OpenRouter API error");
            return Err(RowForgeError::Provider(format!("HTTP {status}: {error_text}")));
        }

        let raw: ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| RowForgeError::parse(format!("invalid completion response: {e}")))?;

        let Some(choice) = raw.choices.into_iter().next() else {
            debug!(model = %request.model, "completion had no choices");
            return Ok(ModelResponse::default());
        };

        Ok(ModelResponse {
            text: message_text(&choice.message.content),
            images: choice
                .message
                .images
                .into_iter()
                .map(|img| image_part(&img.image_url.url))
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatResponseRaw {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageRaw,
}

#[derive(Debug, Deserialize)]
struct ChatMessageRaw {
    #[serde(default)]
    content: Value,
    #[serde(default)]
    images: Vec<ImageRaw>,
}

#[derive(Debug, Deserialize)]
struct ImageRaw {
    image_url: ImageUrlRaw,
}

#[derive(Debug, Deserialize)]
struct ImageUrlRaw {
    url: String,
}

/// Serialize a request into the OpenRouter JSON body.
fn request_body(request: &ModelRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": request.messages.iter().map(message_json).collect::<Vec<_>>(),
    });

    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(seed) = request.seed {
        body["seed"] = json!(seed);
    }
    if let Some(format) = &request.response_format {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {
                "name": format.name,
                "strict": format.strict,
                "schema": format.schema,
            }
        });
    }
    if let Some(effort) = &request.reasoning_effort {
        body["reasoning"] = json!({ "effort": effort });
    }
    if request.generate_images {
        body["modalities"] = json!(["image", "text"]);
        if let Some(ratio) = &request.aspect_ratio {
            body["image_config"] = json!({ "aspect_ratio": ratio });
        }
    }

    body
}

fn message_json(message: &Message) -> Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    // Plain-text messages go over the wire as a string
    let content = if message.content.iter().all(|p| p.as_text().is_some()) {
        Value::String(message.text())
    } else {
        Value::Array(message.content.iter().map(part_json).collect())
    };

    json!({ "role": role, "content": content })
}

fn part_json(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
        ContentPart::ImageUrl { url } => json!({ "type": "image_url", "image_url": { "url": url } }),
        ContentPart::Image { data, mime_type } => json!({
            "type": "image_url",
            "image_url": { "url": format!("data:{mime_type};base64,{data}") }
        }),
        ContentPart::Audio { data, format } => json!({
            "type": "input_audio",
            "input_audio": { "data": data, "format": format }
        }),
    }
}

/// Content may be a string, an array of typed parts, or null.
fn message_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let text = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("");
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

/// Decode a `data:<mime>;base64,<payload>` URL; anything else stays a remote reference.
fn image_part(url: &str) -> ContentPart {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(',') {
            if let Some(mime_type) = meta.strip_suffix(";base64") {
                return ContentPart::Image {
                    data: data.to_string(),
                    mime_type: mime_type.to_string(),
                };
            }
        }
    }
    ContentPart::ImageUrl {
        url: url.to_string(),
    }
}

//! Artifact events and the filesystem writer.
//!
//! The engine never touches the output directory itself. It announces
//! [`ArtifactEvent`]s to an [`ArtifactSink`]; [`FsArtifactWriter`] is the
//! sink used by the CLI.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::debug;

use rowforge_shared::{ContentPart, Result, RowForgeError, RowId};

/// Payload type of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    Text,
    Json,
    /// Base64 image data.
    Image { mime_type: String },
    /// Base64 audio data.
    Audio { format: String },
}

/// One file the engine wants persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactEvent {
    pub row: RowId,
    pub step: usize,
    pub kind: ArtifactKind,
    /// File name including extension, unique within the row.
    pub filename: String,
    pub content: String,
}

impl ArtifactEvent {
    pub fn text(row: &RowId, step: usize, stem: &str, text: impl Into<String>) -> Self {
        Self {
            row: row.clone(),
            step,
            kind: ArtifactKind::Text,
            filename: format!("{stem}.txt"),
            content: text.into(),
        }
    }

    pub fn json(row: &RowId, step: usize, stem: &str, value: &Value) -> Self {
        Self {
            row: row.clone(),
            step,
            kind: ArtifactKind::Json,
            filename: format!("{stem}.json"),
            content: value.to_string(),
        }
    }

    /// Persist a content block verbatim.
    pub fn from_part(row: &RowId, step: usize, stem: &str, part: &ContentPart) -> Self {
        match part {
            ContentPart::Text { text } => Self::text(row, step, stem, text.clone()),
            ContentPart::ImageUrl { url } => Self {
                row: row.clone(),
                step,
                kind: ArtifactKind::Text,
                filename: format!("{stem}.url"),
                content: url.clone(),
            },
            ContentPart::Image { data, mime_type } => Self {
                row: row.clone(),
                step,
                kind: ArtifactKind::Image {
                    mime_type: mime_type.clone(),
                },
                filename: format!("{stem}.{}", image_extension(mime_type)),
                content: data.clone(),
            },
            ContentPart::Audio { data, format } => Self {
                row: row.clone(),
                step,
                kind: ArtifactKind::Audio {
                    format: format.clone(),
                },
                filename: format!("{stem}.{format}"),
                content: data.clone(),
            },
        }
    }
}

fn image_extension(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        _ => "bin",
    }
}

/// Receiver of artifact events.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn emit(&self, event: ArtifactEvent) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Filesystem writer
// ---------------------------------------------------------------------------

/// Writes artifacts to `<root>/<row-id>/<filename>`.
pub struct FsArtifactWriter {
    root: PathBuf,
}

impl FsArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactSink for FsArtifactWriter {
    async fn emit(&self, event: ArtifactEvent) -> Result<()> {
        let dir = self.root.join(event.row.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RowForgeError::io(&dir, e))?;

        let bytes = match &event.kind {
            ArtifactKind::Text => event.content.into_bytes(),
            // Pretty-print when the payload parses; otherwise keep it as given
            ArtifactKind::Json => match serde_json::from_str::<Value>(&event.content) {
                Ok(value) => serde_json::to_string_pretty(&value)
                    .map(String::into_bytes)
                    .unwrap_or_else(|_| event.content.into_bytes()),
                Err(_) => event.content.into_bytes(),
            },
            ArtifactKind::Image { .. } | ArtifactKind::Audio { .. } => {
                STANDARD.decode(event.content.as_bytes()).map_err(|e| {
                    RowForgeError::parse(format!("invalid base64 in {}: {e}", event.filename))
                })?
            }
        };

        let path = dir.join(&event.filename);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| RowForgeError::io(&path, e))?;
        debug!(path = %path.display(), "artifact written");
        Ok(())
    }
}

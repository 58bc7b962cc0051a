//! External verification commands.
//!
//! A step may carry a shell template such as `python check.py {{file}}`.
//! The candidate output is written to a scratch file, `{{file}}` is bound to
//! its path, and a non-zero exit turns the captured output into retry feedback.

use std::path::PathBuf;

use tracing::debug;
use uuid::Uuid;

use rowforge_shared::{Result, RowForgeError};

use crate::truncate_chars;

/// Placeholder bound to the scratch file path.
pub const FILE_PLACEHOLDER: &str = "{{file}}";

/// Captured output is clipped to this many characters per stream.
const MAX_OUTPUT_CHARS: usize = 4_000;

/// A failed verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationFailure {
    pub exit_code: i32,
    pub output: String,
}

impl std::fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "verification command exited with status {}:\n{}",
            self.exit_code, self.output
        )
    }
}

/// Runs a verification command template against candidate output.
#[derive(Debug, Clone)]
pub struct Verifier {
    command: String,
    scratch_dir: PathBuf,
}

impl Verifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Verify `content`; `Ok(None)` means the command accepted it.
    pub async fn check(&self, content: &str, extension: &str) -> Result<Option<VerificationFailure>> {
        let path = self
            .scratch_dir
            .join(format!("rowforge-verify-{}.{extension}", Uuid::now_v7()));
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| RowForgeError::io(&path, e))?;

        let command = self
            .command
            .replace(FILE_PLACEHOLDER, &shell_quote(&path.to_string_lossy()));
        debug!(%command, "running verification command");

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .await;
        let _ = tokio::fs::remove_file(&path).await;
        let output = output.map_err(|e| RowForgeError::io(&path, e))?;

        if output.status.success() {
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut captured = truncate_chars(stdout.trim(), MAX_OUTPUT_CHARS);
        let stderr = truncate_chars(stderr.trim(), MAX_OUTPUT_CHARS);
        if !stderr.is_empty() {
            if !captured.is_empty() {
                captured.push('\n');
            }
            captured.push_str(&stderr);
        }

        Ok(Some(VerificationFailure {
            exit_code: output.status.code().unwrap_or(-1),
            output: captured,
        }))
    }
}

/// Single-quote a path for `sh`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passing_command_returns_none() {
        let verifier = Verifier::new("grep -q hello {{file}}");
        assert_eq!(verifier.check("say hello", "txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failing_command_captures_status_and_output() {
        let verifier = Verifier::new("echo checked {{file}} >/dev/null; echo 'missing field' >&2; exit 3");
        let failure = verifier.check("{}", "json").await.unwrap().unwrap();
        assert_eq!(failure.exit_code, 3);
        assert_eq!(failure.output, "missing field");
        assert!(failure.to_string().contains("status 3"));
    }

    #[tokio::test]
    async fn scratch_file_holds_content_and_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = Verifier::new("cat {{file}}; exit 1").with_scratch_dir(dir.path());
        let failure = verifier.check("payload", "txt").await.unwrap().unwrap();
        assert_eq!(failure.output, "payload");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("/tmp/a'b"), r"'/tmp/a'\''b'");
    }
}

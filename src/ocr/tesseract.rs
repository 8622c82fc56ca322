//! Tesseract CLI engine.
//! One process per request: `tesseract stdin stdout -l <lang>`, encoded image
//! on stdin, UTF-8 text on stdout. The binary is checked once at construction.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{EngineError, EngineProgress, RecognitionEngine};
use crate::config::EngineConfig;

const PHASE_INIT: &str = "initializing api";
const PHASE_RECOGNIZE: &str = "recognizing text";
const MAX_DIAGNOSTIC_CHARS: usize = 200;

pub struct TesseractEngine {
    binary: String,
    available: bool,
}

impl TesseractEngine {
    pub async fn new(binary: &str) -> Self {
        let available = check_binary(binary).await;
        if available {
            info!(binary, "tesseract available");
        } else {
            warn!(binary, "tesseract not found, recognition will fail");
        }
        Self {
            binary: binary.to_string(),
            available,
        }
    }

    pub async fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.tesseract_bin).await
    }

    pub fn is_available(&self) -> bool {
        self.available
    }
}

/// Check that `binary --version` runs and exits cleanly.
async fn check_binary(binary: &str) -> bool {
    tokio::process::Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Map a failed run's stderr to an engine error.
fn classify_failure(stderr: &str, language: &str) -> EngineError {
    if stderr.contains("Failed loading language")
        || stderr.contains("Could not initialize tesseract")
    {
        return EngineError::UnsupportedLanguage(language.to_string());
    }
    let diagnostic: String = stderr.trim().chars().take(MAX_DIAGNOSTIC_CHARS).collect();
    let unreadable = ["pixRead", "Unsupported image type", "Image too small", "Error during processing"];
    if unreadable.iter().any(|marker| stderr.contains(marker)) {
        EngineError::CorruptImage(diagnostic)
    } else if diagnostic.is_empty() {
        EngineError::Internal("tesseract exited with an error and no output".into())
    } else {
        EngineError::Internal(diagnostic)
    }
}

/// Tesseract ends every page with a form feed and newline.
fn clean_output(stdout: &[u8]) -> String {
    String::from_utf8_lossy(stdout)
        .trim_end_matches(|c: char| c == '\u{c}' || c.is_whitespace())
        .to_string()
}

#[async_trait]
impl RecognitionEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(
        &self,
        image: &[u8],
        language: &str,
        progress: &(dyn Fn(EngineProgress) + Send + Sync),
    ) -> Result<String, EngineError> {
        if !self.available {
            return Err(EngineError::NotAvailable(format!(
                "{} could not be executed",
                self.binary
            )));
        }

        progress(EngineProgress::new(PHASE_INIT, 0.0));
        let mut child = tokio::process::Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", language])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Internal(format!("failed to spawn tesseract: {e}")))?;
        debug!(pid = ?child.id(), language, bytes = image.len(), "tesseract spawned");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Internal("failed to get tesseract stdin".into()))?;
        progress(EngineProgress::new(PHASE_RECOGNIZE, 0.0));

        let feed = async move {
            stdin.write_all(image).await?;
            stdin.flush().await?;
            // closing stdin marks end of image
            drop(stdin);
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|e| EngineError::Internal(format!("tesseract wait failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, stderr = %stderr.trim(), "tesseract failed");
            return Err(classify_failure(&stderr, language));
        }
        fed.map_err(|e| EngineError::Internal(format!("write image to tesseract: {e}")))?;

        let text = clean_output(&output.stdout);
        progress(EngineProgress::new(PHASE_RECOGNIZE, 1.0));
        Ok(text)
    }
}

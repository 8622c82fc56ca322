//! Pipeline configuration.
//!
//! Stored as TOML; every field has a default so a partial (or missing) file
//! works. Environment variables override the file:
//! `SCAN_OCR_LANG` (language hint) and `SCAN_OCR_TESSERACT` (engine binary).

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capture::camera::FacingMode;
use crate::error::ScanError;

pub const ENV_LANG: &str = "SCAN_OCR_LANG";
pub const ENV_TESSERACT: &str = "SCAN_OCR_TESSERACT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Language hint passed to the engine (tesseract codes, `+`-joined).
    pub language: String,
    pub camera: CameraConfig,
    pub engine: EngineConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            camera: CameraConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

/// Stream request hints. The platform may grant a different resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Facing mode used when the camera starts.
    pub default_mode: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
    /// Width / height. Portrait 9:16 by default.
    pub aspect_ratio: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            default_mode: FacingMode::Rear,
            ideal_width: 720,
            ideal_height: 1280,
            aspect_ratio: 9.0 / 16.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path or name of the `tesseract` executable.
    pub tesseract_bin: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tesseract_bin: "tesseract".to_string(),
        }
    }
}

impl ScanConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ScanError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ScanError::Config(format!("read {}: {e}", path.display())))?;
        let config: ScanConfig = toml::from_str(&content)
            .map_err(|e| ScanError::Config(format!("parse {}: {e}", path.display())))?;
        info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// File (if given) + environment overrides, validated.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ScanError> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ScanError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ScanError::Config(format!("serialize: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| ScanError::Config(format!("write {}: {e}", path.display())))
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(lang) = lookup(ENV_LANG).filter(|v| !v.trim().is_empty()) {
            debug!(language = %lang, "language overridden from environment");
            self.language = lang.trim().to_string();
        }
        if let Some(bin) = lookup(ENV_TESSERACT).filter(|v| !v.trim().is_empty()) {
            debug!(tesseract_bin = %bin, "engine binary overridden from environment");
            self.engine.tesseract_bin = bin.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        validate_language(&self.language)?;
        let cam = &self.camera;
        if cam.ideal_width == 0 || cam.ideal_height == 0 {
            return Err(ScanError::Config(
                "camera ideal_width and ideal_height must be positive".into(),
            ));
        }
        if !(cam.aspect_ratio.is_finite() && cam.aspect_ratio > 0.0) {
            return Err(ScanError::Config(format!(
                "camera aspect_ratio must be positive, got {}",
                cam.aspect_ratio
            )));
        }
        if self.engine.tesseract_bin.trim().is_empty() {
            return Err(ScanError::Config("engine tesseract_bin is empty".into()));
        }
        Ok(())
    }
}

/// Language codes like `eng`, `chi_sim`, `eng+deu`. Anything else is rejected
/// before it reaches an engine command line.
pub fn validate_language(language: &str) -> Result<(), ScanError> {
    let ok = !language.is_empty()
        && language
            .split('+')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if ok {
        Ok(())
    } else {
        Err(ScanError::Config(format!("invalid language code: {language:?}")))
    }
}

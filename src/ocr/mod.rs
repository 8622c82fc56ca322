//! OCR coordination: one job slot, ordered progress relay, and mapping of the
//! engine's outcome. The engine itself sits behind [`RecognitionEngine`].
//!
//! The engine has no cancel primitive. A superseded job keeps running until
//! the engine settles; its guard suppresses late progress, and its slot can be
//! reclaimed by the next job as soon as the guard is cancelled.

pub mod tesseract;

pub use tesseract::TesseractEngine;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::cancellation::GenerationGuard;
use crate::capture::CanonicalImage;
use crate::config::validate_language;
use crate::error::ScanError;
use crate::metrics::{metric_names, MetricsRegistry};

/// Progress event emitted by an engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineProgress {
    /// Engine-defined label, e.g. "initializing api", "recognizing text".
    pub phase: String,
    /// Fraction in [0, 1].
    pub progress: f32,
}

impl EngineProgress {
    pub fn new(phase: impl Into<String>, progress: f32) -> Self {
        Self {
            phase: phase.into(),
            progress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotAvailable(String),
    UnsupportedLanguage(String),
    CorruptImage(String),
    Internal(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotAvailable(msg) => write!(f, "engine not available: {msg}"),
            EngineError::UnsupportedLanguage(lang) => write!(f, "unsupported language: {lang}"),
            EngineError::CorruptImage(msg) => write!(f, "image could not be read: {msg}"),
            EngineError::Internal(msg) => write!(f, "engine error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<EngineError> for ScanError {
    fn from(e: EngineError) -> Self {
        ScanError::RecognitionFailed(e.to_string())
    }
}

/// Recognition engine (platform/model adapter).
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Recognize text in an encoded image. `progress` may be called any
    /// number of times before the call returns, never after.
    async fn recognize(
        &self,
        image: &[u8],
        language: &str,
        progress: &(dyn Fn(EngineProgress) + Send + Sync),
    ) -> Result<String, EngineError>;
}

struct ActiveJob {
    id: Uuid,
    guard: Option<GenerationGuard>,
}

impl ActiveJob {
    /// Unbound jobs are live until their ticket drops.
    fn is_live(&self) -> bool {
        self.guard.as_ref().map_or(true, GenerationGuard::should_continue)
    }
}

type Slot = Arc<Mutex<Option<ActiveJob>>>;

/// Reservation of the single job slot. Releases the slot on drop.
pub struct JobTicket {
    id: Uuid,
    guard: Option<GenerationGuard>,
    slot: Slot,
}

impl JobTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Adopt the caller's job id and bind the slot to a generation guard, so
    /// the slot frees itself once the job is superseded.
    pub fn bind(&mut self, job_id: Uuid, guard: GenerationGuard) {
        let mut slot = self.slot.lock();
        if let Some(active) = slot.as_mut().filter(|a| a.id == self.id) {
            active.id = job_id;
            active.guard = Some(guard.clone());
        }
        self.id = job_id;
        self.guard = Some(guard);
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map(|a| a.id) == Some(self.id) {
            *slot = None;
        }
    }
}

impl std::fmt::Debug for JobTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTicket").field("id", &self.id).finish()
    }
}

/// Admits progress in non-decreasing order. Offending events are dropped,
/// never rewritten.
struct ProgressGate {
    last: Mutex<Option<f32>>,
}

impl ProgressGate {
    fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    /// Forward `event` if admissible. The gate stays locked while forwarding
    /// so deliveries reach the caller in the order they were admitted.
    fn forward(&self, job_id: Uuid, event: EngineProgress, deliver: impl FnOnce(&EngineProgress)) {
        let mut last = self.last.lock();
        if !event.progress.is_finite() || !(0.0..=1.0).contains(&event.progress) {
            warn!(job = %job_id, progress = event.progress, "out-of-range progress dropped");
            return;
        }
        if let Some(prev) = last.filter(|prev| event.progress < *prev) {
            debug!(job = %job_id, prev, progress = event.progress, "regressing progress dropped");
            return;
        }
        *last = Some(event.progress);
        deliver(&event);
    }
}

/// Drives the engine for one job at a time.
pub struct RecognitionOrchestrator {
    engine: Arc<dyn RecognitionEngine>,
    slot: Slot,
    metrics: Arc<MetricsRegistry>,
}

impl RecognitionOrchestrator {
    pub fn new(engine: Arc<dyn RecognitionEngine>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            engine,
            slot: Arc::new(Mutex::new(None)),
            metrics,
        }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// True while a live job holds the slot.
    pub fn is_busy(&self) -> bool {
        self.slot.lock().as_ref().map_or(false, ActiveJob::is_live)
    }

    /// Reserve the slot, or fail with `Busy` if a live job holds it.
    pub fn reserve(&self) -> Result<JobTicket, ScanError> {
        let mut slot = self.slot.lock();
        if let Some(active) = slot.as_ref() {
            if active.is_live() {
                debug!(job = %active.id, "recognition rejected: busy");
                return Err(ScanError::Busy);
            }
            debug!(job = %active.id, "reclaiming slot of superseded job");
        }
        let id = Uuid::new_v4();
        *slot = Some(ActiveJob { id, guard: None });
        Ok(JobTicket {
            id,
            guard: None,
            slot: Arc::clone(&self.slot),
        })
    }

    /// Run a reserved job to completion. The slot is released before this
    /// returns, so a caller may start the next job right after applying the
    /// outcome.
    pub async fn run(
        &self,
        ticket: JobTicket,
        image: &CanonicalImage,
        language: &str,
        on_progress: impl Fn(&EngineProgress) + Send + Sync,
    ) -> Result<String, ScanError> {
        validate_language(language)
            .map_err(|_| ScanError::InvalidInput(format!("invalid language code: {language:?}")))?;

        let job_id = ticket.id();
        let guard = ticket.guard.clone();
        let gate = ProgressGate::new();
        let first_seen = AtomicBool::new(false);
        let started = Instant::now();
        let metrics = &self.metrics;

        let relay = |event: EngineProgress| {
            if guard.as_ref().map_or(false, |g| !g.should_continue()) {
                trace!(job = %job_id, phase = %event.phase, "progress of superseded job dropped");
                return;
            }
            gate.forward(job_id, event, |event| {
                if !first_seen.swap(true, Ordering::Relaxed) {
                    metrics.record(
                        metric_names::RECOGNIZE_FIRST_PROGRESS,
                        started.elapsed().as_micros() as f64,
                    );
                }
                on_progress(event);
            });
        };

        info!(
            job = %job_id,
            engine = self.engine.name(),
            image = %image.id(),
            bytes = image.len(),
            language,
            "engine_invoked"
        );
        let span = self.metrics.span(metric_names::RECOGNIZE_DONE);
        let result = self.engine.recognize(image.bytes(), language, &relay).await;
        let elapsed_us = span.finish();
        drop(ticket);

        match result {
            Ok(text) => {
                info!(job = %job_id, elapsed_us, chars = text.chars().count(), "engine_settled");
                Ok(text)
            }
            Err(e) => {
                warn!(job = %job_id, elapsed_us, error = %e, "engine_failed");
                Err(e.into())
            }
        }
    }

    /// Reserve and run in one step.
    pub async fn recognize(
        &self,
        image: &CanonicalImage,
        language: &str,
        on_progress: impl Fn(&EngineProgress) + Send + Sync,
    ) -> Result<String, ScanError> {
        let ticket = self.reserve()?;
        self.run(ticket, image, language, on_progress).await
    }
}

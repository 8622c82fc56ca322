//! State machine: Idle → ImageReady → Recognizing → Recognized | Failed.
//! A new image resets to ImageReady from any state; there is no terminal state.
//! The image carried by Recognizing/Recognized/Failed is always the one that
//! started the job, and a job's outcome only lands while its id is current.

use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancellation::{GenerationGuard, TaskGeneration};
use crate::capture::{CanonicalImage, ImageSource};
use crate::error::ScanError;

/// Discriminant of [`PipelineState`], used for transition validation and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatePhase {
    Idle,
    ImageReady,
    Recognizing,
    Recognized,
    Failed,
}

impl std::fmt::Display for StatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatePhase::Idle => write!(f, "Idle"),
            StatePhase::ImageReady => write!(f, "ImageReady"),
            StatePhase::Recognizing => write!(f, "Recognizing"),
            StatePhase::Recognized => write!(f, "Recognized"),
            StatePhase::Failed => write!(f, "Failed"),
        }
    }
}

impl StatePhase {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: StatePhase) -> bool {
        use StatePhase::*;
        matches!(
            (self, next),
            // capture or upload, from anywhere
            (_, ImageReady)
                | (ImageReady, Recognizing)
                // retry on the same image
                | (Recognized, Recognizing)
                | (Failed, Recognizing)
                // progress
                | (Recognizing, Recognizing)
                | (Recognizing, Recognized)
                | (Recognizing, Failed)
        )
    }
}

/// One in-flight recognition attempt.
#[derive(Debug, Clone)]
pub struct RecognitionJob {
    pub id: Uuid,
    pub language: String,
    /// Last engine phase label, e.g. "recognizing text".
    pub phase: Option<String>,
    /// Last reported fraction in [0, 1].
    pub progress: f32,
    pub started_at: Instant,
}

impl RecognitionJob {
    fn new(language: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            language: language.to_string(),
            phase: None,
            progress: 0.0,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PipelineState {
    Idle,
    ImageReady {
        image: CanonicalImage,
    },
    Recognizing {
        image: CanonicalImage,
        job: RecognitionJob,
    },
    Recognized {
        image: CanonicalImage,
        /// May be empty: no text found is still a success.
        text: String,
    },
    Failed {
        image: CanonicalImage,
        error: ScanError,
    },
}

impl PipelineState {
    pub fn phase(&self) -> StatePhase {
        match self {
            PipelineState::Idle => StatePhase::Idle,
            PipelineState::ImageReady { .. } => StatePhase::ImageReady,
            PipelineState::Recognizing { .. } => StatePhase::Recognizing,
            PipelineState::Recognized { .. } => StatePhase::Recognized,
            PipelineState::Failed { .. } => StatePhase::Failed,
        }
    }

    pub fn image(&self) -> Option<&CanonicalImage> {
        match self {
            PipelineState::Idle => None,
            PipelineState::ImageReady { image }
            | PipelineState::Recognizing { image, .. }
            | PipelineState::Recognized { image, .. }
            | PipelineState::Failed { image, .. } => Some(image),
        }
    }

    pub fn job(&self) -> Option<&RecognitionJob> {
        match self {
            PipelineState::Recognizing { job, .. } => Some(job),
            _ => None,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.phase())
    }
}

/// Everything a job task needs after `begin_recognition` succeeds.
pub struct RecognitionStart {
    pub image: CanonicalImage,
    pub job: RecognitionJob,
    pub guard: GenerationGuard,
}

/// Thread-safe state machine with watch channel for reactive subscribers.
/// Each transition is one write-locked section, so there is a single writer
/// at any instant.
pub struct StateMachine {
    state: RwLock<PipelineState>,
    generation: TaskGeneration,
    state_tx: watch::Sender<PipelineState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Idle);
        Self {
            state: RwLock::new(PipelineState::Idle),
            generation: TaskGeneration::new(),
            state_tx,
        }
    }

    /// Current state (clone of the snapshot).
    pub fn current(&self) -> PipelineState {
        self.state.read().clone()
    }

    pub fn phase(&self) -> StatePhase {
        self.state.read().phase()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }

    /// Image generation; advances on every new image.
    pub fn generation(&self) -> u64 {
        self.generation.current_generation()
    }

    fn commit(&self, state: &mut PipelineState, next: PipelineState) -> Result<(), ScanError> {
        let from = state.phase();
        let to = next.phase();
        if !from.can_transition_to(to) {
            let msg = format!("invalid transition: {from} -> {to}");
            warn!("{}", msg);
            return Err(ScanError::InvalidInput(msg));
        }
        *state = next;
        self.state_tx.send_replace(state.clone());
        if from != to {
            info!(from = %from, to = %to, "state_transition");
        }
        Ok(())
    }

    /// A capture or upload completed. Always lands in ImageReady; any
    /// in-flight job is superseded and its guard cancelled. Returns the
    /// superseded job id, if any.
    pub fn set_image(&self, image: CanonicalImage) -> Option<Uuid> {
        let mut state = self.state.write();
        let superseded = state.job().map(|job| job.id);
        let generation = self.generation.cancel_and_advance();
        let image_id = image.id();
        let committed = self.commit(&mut state, PipelineState::ImageReady { image });
        debug_assert!(committed.is_ok(), "every phase accepts a new image: {committed:?}");
        info!(image = %image_id, generation, "image_ready");
        if let Some(job_id) = superseded {
            info!(job = %job_id, "in-flight recognition superseded by new image");
        }
        superseded
    }

    /// Start a job on the current image. Rejected with `InvalidInput` when
    /// there is no image and with `Busy` while a job is running.
    pub fn begin_recognition(&self, language: &str) -> Result<RecognitionStart, ScanError> {
        let mut state = self.state.write();
        let image = match &*state {
            PipelineState::Idle => {
                return Err(ScanError::InvalidInput(
                    "capture or upload an image first".into(),
                ))
            }
            PipelineState::Recognizing { job, .. } => {
                debug!(job = %job.id, "recognition rejected: busy");
                return Err(ScanError::Busy);
            }
            PipelineState::ImageReady { image }
            | PipelineState::Recognized { image, .. }
            | PipelineState::Failed { image, .. } => image.clone(),
        };

        let job = RecognitionJob::new(language);
        let guard = self.generation.guard();
        self.commit(
            &mut state,
            PipelineState::Recognizing {
                image: image.clone(),
                job: job.clone(),
            },
        )?;
        info!(job = %job.id, image = %image.id(), language, "recognition_started");
        Ok(RecognitionStart { image, job, guard })
    }

    /// Record engine progress for `job_id`. Ignored unless that job is current.
    pub fn update_progress(&self, job_id: Uuid, phase: &str, progress: f32) -> bool {
        let mut state = self.state.write();
        let updated = match &mut *state {
            PipelineState::Recognizing { job, .. } if job.id == job_id => {
                job.phase = Some(phase.to_string());
                job.progress = progress;
                true
            }
            _ => false,
        };
        if updated {
            self.state_tx.send_replace(state.clone());
            debug!(job = %job_id, phase, progress, "recognition_progress");
        }
        updated
    }

    /// Apply a job's outcome. Ignored (returns false) if the state has moved
    /// on to a different image or job.
    pub fn complete_recognition(&self, job_id: Uuid, outcome: Result<String, ScanError>) -> bool {
        let mut state = self.state.write();
        let image = match &*state {
            PipelineState::Recognizing { image, job } if job.id == job_id => image.clone(),
            other => {
                debug!(job = %job_id, state = %other, "stale recognition outcome ignored");
                return false;
            }
        };
        let next = match outcome {
            Ok(text) => {
                info!(job = %job_id, chars = text.chars().count(), "recognition_succeeded");
                PipelineState::Recognized { image, text }
            }
            Err(error) => {
                warn!(job = %job_id, error = %error, "recognition_failed");
                PipelineState::Failed { image, error }
            }
        };
        self.commit(&mut state, next).is_ok()
    }

    /// Teardown: cancel every guard so in-flight jobs discard their results.
    pub fn shutdown(&self) {
        self.generation.cancel_all();
        debug!(state = %self.phase(), "state machine shut down");
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of the state for front ends.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state: StatePhase,
    pub image: Option<ImageSummary>,
    pub job_id: Option<String>,
    pub phase: Option<String>,
    pub progress: Option<f32>,
    pub text: Option<String>,
    pub error: Option<ErrorSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub id: String,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
    pub source: ImageSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub kind: &'static str,
    pub message: String,
}

impl From<&PipelineState> for StateSnapshot {
    fn from(state: &PipelineState) -> Self {
        let image = state.image().map(|img| {
            let (width, height) = img.dimensions();
            ImageSummary {
                id: img.id(),
                mime: img.mime().to_string(),
                width,
                height,
                bytes: img.len(),
                source: img.source(),
            }
        });
        let job = state.job();
        let (text, error) = match state {
            PipelineState::Recognized { text, .. } => (Some(text.clone()), None),
            PipelineState::Failed { error, .. } => (
                None,
                Some(ErrorSummary {
                    kind: error.kind(),
                    message: error.to_string(),
                }),
            ),
            _ => (None, None),
        };
        Self {
            state: state.phase(),
            image,
            job_id: job.map(|j| j.id.to_string()),
            phase: job.and_then(|j| j.phase.clone()),
            progress: job.map(|j| j.progress),
            text,
            error,
        }
    }
}

//! Scan session: the user-facing surface of the pipeline.
//!
//! Owns the camera session, the state machine and the recognition
//! orchestrator. Capture and upload both end in `StateMachine::set_image`;
//! recognition runs on a spawned task and reports back through the state
//! machine, so observers only ever need `subscribe()`.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::camera::{CameraDevice, CameraManager, CameraSession, CameraStatus, FacingMode};
use crate::capture::{self, CanonicalImage};
use crate::config::ScanConfig;
use crate::error::ScanError;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::ocr::{EngineProgress, RecognitionEngine, RecognitionOrchestrator};
use crate::state_machine::{PipelineState, RecognitionStart, StateMachine, StatePhase, StateSnapshot};

/// How a recognition job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The outcome was applied to the state (Recognized or Failed).
    Applied(Result<String, ScanError>),
    /// A newer image (or teardown) superseded the job; its outcome was dropped.
    Discarded,
}

/// Handle to a spawned recognition job.
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    task: JoinHandle<JobOutcome>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the engine to settle and the outcome to be applied or dropped.
    pub async fn finished(self) -> JobOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(job = %self.id, error = %e, "recognition task aborted");
                JobOutcome::Discarded
            }
        }
    }
}

/// What to do when a freshly acquired stream meets an already installed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Install {
    /// Keep a live installed session; release the fresh one.
    KeepExisting,
    /// Replace the installed session; release the old one.
    Swap,
}

pub struct ScanSession {
    config: ScanConfig,
    state: Arc<StateMachine>,
    camera: CameraManager,
    /// Never held across an await; acquisition runs outside it.
    session: parking_lot::Mutex<Option<CameraSession>>,
    /// Cancelled (and replaced) whenever the camera is stopped, abandoning
    /// any acquisition still waiting on the device.
    open_cancel: parking_lot::Mutex<CancellationToken>,
    desired_mode: parking_lot::Mutex<FacingMode>,
    orchestrator: Arc<RecognitionOrchestrator>,
    metrics: Arc<MetricsRegistry>,
}

impl ScanSession {
    pub fn new(
        config: ScanConfig,
        device: Arc<dyn CameraDevice>,
        engine: Arc<dyn RecognitionEngine>,
    ) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let camera = CameraManager::new(device, config.camera.clone(), Arc::clone(&metrics));
        let orchestrator = Arc::new(RecognitionOrchestrator::new(engine, Arc::clone(&metrics)));
        info!(
            language = %config.language,
            engine = orchestrator.engine_name(),
            mode = %config.camera.default_mode,
            "scan session created"
        );
        Self {
            desired_mode: parking_lot::Mutex::new(config.camera.default_mode),
            config,
            state: Arc::new(StateMachine::new()),
            camera,
            session: parking_lot::Mutex::new(None),
            open_cancel: parking_lot::Mutex::new(CancellationToken::new()),
            orchestrator,
            metrics,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    pub fn phase(&self) -> StatePhase {
        self.state.phase()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::from(&self.state.current())
    }

    /// Every committed state change, including progress updates.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn camera_status(&self) -> CameraStatus {
        self.camera.status()
    }

    pub fn subscribe_camera(&self) -> watch::Receiver<CameraStatus> {
        self.camera.subscribe_status()
    }

    /// Facing mode the next camera open will request.
    pub fn desired_mode(&self) -> FacingMode {
        *self.desired_mode.lock()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Open the camera in the desired mode. No-op if a live session exists.
    pub async fn start_camera(&self) -> Result<FacingMode, ScanError> {
        if let Some(mode) = self.live_mode() {
            return Ok(mode);
        }
        let mode = self.desired_mode();
        let (fresh, cancel) = self.acquire(mode).await?;
        self.install(fresh, &cancel, Install::KeepExisting)
    }

    /// Release the camera and abandon any acquisition still pending on the
    /// device. Idempotent; never waits on the device.
    pub fn stop_camera(&self) {
        let mut slot = self.session.lock();
        let abandoned = std::mem::replace(&mut *self.open_cancel.lock(), CancellationToken::new());
        abandoned.cancel();
        match slot.take() {
            Some(mut session) => self.camera.close(&mut session),
            None => self.camera.sync_status(None),
        }
    }

    /// Mode of the installed session, if it is live. A dead session is
    /// released on the way.
    fn live_mode(&self) -> Option<FacingMode> {
        let mut slot = self.session.lock();
        if slot.as_ref().map_or(false, |s| !s.is_live()) {
            if let Some(mut stale) = slot.take() {
                debug!(mode = %stale.mode(), "dropping dead camera session");
                self.camera.close(&mut stale);
            }
        }
        slot.as_ref().map(CameraSession::mode)
    }

    /// Request a stream without holding the session slot. `stop_camera` and
    /// teardown cancel the wait.
    async fn acquire(&self, mode: FacingMode) -> Result<(CameraSession, CancellationToken), ScanError> {
        let cancel = self.open_cancel.lock().clone();
        tokio::select! {
            opened = self.camera.open(mode) => opened.map(|session| (session, cancel)),
            _ = cancel.cancelled() => {
                info!(mode = %mode, "camera acquisition abandoned");
                Err(ScanError::DeviceUnavailable)
            }
        }
    }

    /// Put a freshly acquired session in the slot, unless the camera was
    /// stopped while it was being acquired.
    fn install(
        &self,
        mut fresh: CameraSession,
        cancel: &CancellationToken,
        policy: Install,
    ) -> Result<FacingMode, ScanError> {
        let mut slot = self.session.lock();
        if cancel.is_cancelled() {
            fresh.close();
            self.camera.sync_status(slot.as_ref());
            info!(mode = %fresh.mode(), "camera stopped during acquisition, stream released");
            return Err(ScanError::DeviceUnavailable);
        }
        let keep_existing =
            policy == Install::KeepExisting && slot.as_ref().map_or(false, CameraSession::is_live);
        if keep_existing {
            fresh.close();
        } else if let Some(mut old) = slot.replace(fresh) {
            old.close();
            info!(from = %old.mode(), "camera_switched");
        }
        self.camera.sync_status(slot.as_ref());
        slot.as_ref().map(CameraSession::mode).ok_or(ScanError::DeviceUnavailable)
    }

    /// Grab the current frame at the stream's native resolution and make it
    /// the current image. Opens the camera first if needed; camera failures
    /// leave the pipeline state untouched.
    pub async fn trigger_capture(&self) -> Result<CanonicalImage, ScanError> {
        self.start_camera().await?;

        let span = self.metrics.span(metric_names::FRAME_CAPTURE);
        let frame = {
            let mut slot = self.session.lock();
            let session = slot.as_mut().ok_or(ScanError::DeviceUnavailable)?;
            let frame = session.grab_frame();
            if frame.is_err() && !session.is_live() {
                if let Some(mut dead) = slot.take() {
                    self.camera.close(&mut dead);
                }
            }
            frame?
        };

        let image = tokio::task::spawn_blocking(move || capture::from_captured_frame(&frame))
            .await
            .map_err(|e| ScanError::InvalidInput(format!("frame encode task failed: {e}")))??;
        let elapsed_us = span.finish();

        let (width, height) = image.dimensions();
        info!(image = %image.id(), width, height, elapsed_us, "frame_captured");
        self.state.set_image(image.clone());
        Ok(image)
    }

    /// Switch between front and rear. The new stream is acquired before the
    /// installed one is released, so a failed switch leaves the current
    /// camera running. The desired mode only changes on success.
    pub async fn toggle_camera_mode(&self) -> Result<FacingMode, ScanError> {
        let target = self.desired_mode().toggled();
        let (fresh, cancel) = self.acquire(target).await?;
        let mode = self.install(fresh, &cancel, Install::Swap)?;
        *self.desired_mode.lock() = mode;
        info!(mode = %mode, "camera_mode_toggled");
        Ok(mode)
    }

    /// Accept uploaded bytes with their declared MIME type.
    pub async fn trigger_upload(
        &self,
        bytes: Vec<u8>,
        declared_mime: &str,
    ) -> Result<CanonicalImage, ScanError> {
        let span = self.metrics.span(metric_names::UPLOAD_DECODE);
        let image = capture::from_uploaded_file(bytes, declared_mime).await?;
        let elapsed_us = span.finish();
        info!(image = %image.id(), mime = image.mime(), elapsed_us, "upload_accepted");
        self.state.set_image(image.clone());
        Ok(image)
    }

    /// Upload a file from disk; MIME type inferred from the extension.
    pub async fn upload_path(&self, path: &Path) -> Result<CanonicalImage, ScanError> {
        let span = self.metrics.span(metric_names::UPLOAD_DECODE);
        let image = capture::from_path(path).await?;
        let elapsed_us = span.finish();
        info!(image = %image.id(), path = %path.display(), elapsed_us, "upload_accepted");
        self.state.set_image(image.clone());
        Ok(image)
    }

    /// Start recognizing the current image on a spawned task. Fails
    /// synchronously with `InvalidInput` (no image) or `Busy` (job running).
    /// Must be called within a tokio runtime.
    pub fn trigger_recognize(&self) -> Result<JobHandle, ScanError> {
        let mut ticket = self.orchestrator.reserve()?;
        let start = self.state.begin_recognition(&self.config.language)?;
        ticket.bind(start.job.id, start.guard.clone());

        let id = start.job.id;
        let state = Arc::clone(&self.state);
        let orchestrator = Arc::clone(&self.orchestrator);
        let metrics = Arc::clone(&self.metrics);

        let task = tokio::spawn(async move {
            let RecognitionStart { image, job, guard } = start;
            let job_id = job.id;

            // own task so an engine panic unwinds here, not through the job
            let progress_state = Arc::clone(&state);
            let run = tokio::spawn(async move {
                orchestrator
                    .run(ticket, &image, &job.language, |p: &EngineProgress| {
                        progress_state.update_progress(job.id, &p.phase, p.progress);
                    })
                    .await
            });
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(e) => Err(engine_task_failure(job_id, e)),
            };

            if !guard.should_continue() {
                metrics.record(metric_names::JOBS_DISCARDED, 1.0);
                info!(job = %job_id, "recognition outcome discarded: superseded");
                return JobOutcome::Discarded;
            }
            if state.complete_recognition(job_id, outcome.clone()) {
                JobOutcome::Applied(outcome)
            } else {
                JobOutcome::Discarded
            }
        });

        Ok(JobHandle { id, task })
    }

    /// Teardown: release the camera, abandon pending acquisitions and cancel
    /// any in-flight job so its outcome is discarded. Dropping the session
    /// does the same.
    pub fn shutdown(self) {
        self.teardown();
        info!("scan session shut down");
    }

    fn teardown(&self) {
        self.state.shutdown();
        self.stop_camera();
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Map a recognition task that died (engine panic or runtime shutdown) to a
/// failure the state machine can record.
fn engine_task_failure(job_id: Uuid, err: JoinError) -> ScanError {
    if err.is_panic() {
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(job = %job_id, panic = %message, "recognition engine panicked");
        ScanError::RecognitionFailed(format!("engine panicked: {message}"))
    } else {
        warn!(job = %job_id, error = %err, "recognition task cancelled");
        ScanError::RecognitionFailed(format!("recognition task cancelled: {err}"))
    }
}

//! Camera session lifecycle: acquire with constraints, grab frames, release.
//! At most one session is open per manager user; a mode switch acquires the
//! new stream before releasing the old one, and every session stops its
//! tracks exactly once (explicit close or drop).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::VideoFrame;
use crate::config::CameraConfig;
use crate::error::ScanError;
use crate::metrics::{metric_names, MetricsRegistry};

/// Which way the camera faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Selfie camera ("user").
    Front,
    /// Back camera ("environment").
    Rear,
}

impl FacingMode {
    pub fn toggled(self) -> Self {
        match self {
            FacingMode::Front => FacingMode::Rear,
            FacingMode::Rear => FacingMode::Front,
        }
    }
}

impl std::fmt::Display for FacingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FacingMode::Front => write!(f, "front"),
            FacingMode::Rear => write!(f, "rear"),
        }
    }
}

/// Stream request. Everything except `facing` is a hint; the granted stream
/// reports its real resolution through [`StreamHandle::resolution`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamConstraints {
    pub facing: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub aspect_ratio: f32,
}

impl StreamConstraints {
    pub fn from_config(config: &CameraConfig, facing: FacingMode) -> Self {
        Self {
            facing,
            ideal_width: config.ideal_width,
            ideal_height: config.ideal_height,
            aspect_ratio: config.aspect_ratio,
        }
    }
}

/// Failure reported by the platform camera capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    NotFound,
    PermissionDenied,
    Busy,
    Other(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::NotFound => write!(f, "no matching camera"),
            DeviceError::PermissionDenied => write!(f, "camera access refused"),
            DeviceError::Busy => write!(f, "camera held by another process"),
            DeviceError::Other(msg) => write!(f, "camera error: {msg}"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<DeviceError> for ScanError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::PermissionDenied => ScanError::PermissionDenied,
            DeviceError::Busy => ScanError::DeviceBusy,
            DeviceError::NotFound | DeviceError::Other(_) => ScanError::DeviceUnavailable,
        }
    }
}

/// A granted hardware stream (platform adapter).
pub trait StreamHandle: Send {
    /// Current negotiated resolution.
    fn resolution(&self) -> (u32, u32);
    /// Grab the current frame at its intrinsic size.
    fn grab_frame(&mut self) -> Result<VideoFrame, DeviceError>;
    /// Stop every underlying track and release the hardware.
    fn stop_all_tracks(&mut self);
    fn is_live(&self) -> bool;
}

/// Platform camera capability (platform adapter).
#[async_trait]
pub trait CameraDevice: Send + Sync {
    async fn request_stream(
        &self,
        constraints: StreamConstraints,
    ) -> Result<Box<dyn StreamHandle>, DeviceError>;
}

/// Device for hosts without camera access; every request fails with `NotFound`.
pub struct NoCamera;

#[async_trait]
impl CameraDevice for NoCamera {
    async fn request_stream(
        &self,
        _constraints: StreamConstraints,
    ) -> Result<Box<dyn StreamHandle>, DeviceError> {
        Err(DeviceError::NotFound)
    }
}

/// One open (or closed) hardware stream.
pub struct CameraSession {
    mode: FacingMode,
    stream: Box<dyn StreamHandle>,
    open: bool,
    opened_at: Instant,
}

impl CameraSession {
    fn new(mode: FacingMode, stream: Box<dyn StreamHandle>) -> Self {
        Self {
            mode,
            stream,
            open: true,
            opened_at: Instant::now(),
        }
    }

    pub fn mode(&self) -> FacingMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Open and the underlying stream still reports healthy tracks.
    pub fn is_live(&self) -> bool {
        self.open && self.stream.is_live()
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.stream.resolution()
    }

    pub fn grab_frame(&mut self) -> Result<VideoFrame, ScanError> {
        if !self.open {
            return Err(ScanError::DeviceUnavailable);
        }
        self.stream.grab_frame().map_err(|e| {
            warn!(error = %e, mode = %self.mode, "frame grab failed");
            ScanError::from(e)
        })
    }

    /// Stop all tracks. Returns false (and does nothing) if already closed.
    pub fn close(&mut self) -> bool {
        if !self.open {
            return false;
        }
        self.stream.stop_all_tracks();
        self.open = false;
        info!(
            mode = %self.mode,
            held_ms = self.opened_at.elapsed().as_millis() as u64,
            "camera_closed"
        );
        true
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        if self.close() {
            debug!(mode = %self.mode, "camera session released on drop");
        }
    }
}

impl std::fmt::Debug for CameraSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraSession")
            .field("mode", &self.mode)
            .field("open", &self.open)
            .field("resolution", &self.stream.resolution())
            .finish()
    }
}

/// Observable camera availability for the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CameraStatus {
    Closed,
    /// Acquisition in flight (permission prompt, device negotiation).
    Opening { mode: FacingMode },
    Open { mode: FacingMode, width: u32, height: u32 },
}

/// Restores the previous status if an acquisition fails or is abandoned,
/// unless something else has published a status since.
struct OpeningGuard<'a> {
    tx: &'a watch::Sender<CameraStatus>,
    mode: FacingMode,
    previous: Option<CameraStatus>,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let opening = CameraStatus::Opening { mode: self.mode };
            self.tx.send_if_modified(|status| {
                if *status == opening {
                    *status = previous;
                    true
                } else {
                    false
                }
            });
        }
    }
}

/// Opens, closes and switches camera sessions against one device.
pub struct CameraManager {
    device: Arc<dyn CameraDevice>,
    config: CameraConfig,
    status_tx: watch::Sender<CameraStatus>,
    metrics: Arc<MetricsRegistry>,
}

impl CameraManager {
    pub fn new(
        device: Arc<dyn CameraDevice>,
        config: CameraConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let (status_tx, _) = watch::channel(CameraStatus::Closed);
        Self {
            device,
            config,
            status_tx,
            metrics,
        }
    }

    pub fn status(&self) -> CameraStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<CameraStatus> {
        self.status_tx.subscribe()
    }

    /// Request a stream facing `mode`.
    pub async fn open(&self, mode: FacingMode) -> Result<CameraSession, ScanError> {
        let constraints = StreamConstraints::from_config(&self.config, mode);
        let previous = self.status_tx.send_replace(CameraStatus::Opening { mode });
        let mut restore = OpeningGuard {
            tx: &self.status_tx,
            mode,
            previous: Some(previous),
        };
        info!(
            mode = %mode,
            ideal_width = constraints.ideal_width,
            ideal_height = constraints.ideal_height,
            "camera_open_requested"
        );

        let span = self.metrics.span(metric_names::CAMERA_OPEN);
        let stream = self.device.request_stream(constraints).await.map_err(|e| {
            warn!(error = %e, mode = %mode, "camera open failed");
            ScanError::from(e)
        })?;
        let elapsed_us = span.finish();

        let session = CameraSession::new(mode, stream);
        let (width, height) = session.resolution();
        restore.previous = None;
        self.status_tx
            .send_replace(CameraStatus::Open { mode, width, height });
        info!(mode = %mode, width, height, elapsed_us, "camera_opened");
        Ok(session)
    }

    /// Publish the status of whatever session is now current.
    pub fn sync_status(&self, current: Option<&CameraSession>) {
        let status = match current.filter(|s| s.is_open()) {
            Some(session) => {
                let (width, height) = session.resolution();
                CameraStatus::Open {
                    mode: session.mode(),
                    width,
                    height,
                }
            }
            None => CameraStatus::Closed,
        };
        self.status_tx.send_if_modified(|prev| {
            let changed = *prev != status;
            *prev = status;
            changed
        });
    }

    /// Close a session. Idempotent.
    pub fn close(&self, session: &mut CameraSession) {
        if session.close() {
            self.status_tx.send_replace(CameraStatus::Closed);
        }
    }

    /// Confirm-then-swap: acquire `mode` first, release `current` only once
    /// the new stream is granted. On failure `current` is left running.
    pub async fn switch_mode(
        &self,
        current: &mut CameraSession,
        mode: FacingMode,
    ) -> Result<(), ScanError> {
        if current.is_open() && current.mode() == mode {
            return Ok(());
        }
        let fresh = self.open(mode).await?;
        let mut old = std::mem::replace(current, fresh);
        old.close();
        info!(from = %old.mode(), to = %mode, "camera_switched");
        Ok(())
    }
}

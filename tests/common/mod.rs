//! Scripted collaborators for driving a `ScanSession` end to end.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use scan_ocr::capture::camera::{
    CameraDevice, DeviceError, FacingMode, StreamConstraints, StreamHandle,
};
use scan_ocr::capture::VideoFrame;
use scan_ocr::{EngineError, EngineProgress, RecognitionEngine, ScanConfig, ScanSession};

pub struct FakeStream {
    resolution: (u32, u32),
    shade: u8,
    stops: Arc<AtomicUsize>,
    live: bool,
}

impl StreamHandle for FakeStream {
    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn grab_frame(&mut self) -> Result<VideoFrame, DeviceError> {
        let (w, h) = self.resolution;
        Ok(VideoFrame::new(vec![self.shade; (w * h * 4) as usize], w, h))
    }

    fn stop_all_tracks(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.live = false;
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

/// Camera that answers requests from a script; once the script runs out it
/// keeps answering with `fallback`.
pub struct FakeCamera {
    script: Mutex<VecDeque<Result<(u32, u32), DeviceError>>>,
    fallback: Result<(u32, u32), DeviceError>,
    requests: Mutex<Vec<StreamConstraints>>,
    grants: Mutex<Vec<(FacingMode, Arc<AtomicUsize>)>>,
}

impl FakeCamera {
    pub fn granting(width: u32, height: u32) -> Arc<Self> {
        Self::scripted(Vec::new(), Ok((width, height)))
    }

    pub fn refusing(error: DeviceError) -> Arc<Self> {
        Self::scripted(Vec::new(), Err(error))
    }

    pub fn scripted(
        script: Vec<Result<(u32, u32), DeviceError>>,
        fallback: Result<(u32, u32), DeviceError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
            grants: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<StreamConstraints> {
        self.requests.lock().clone()
    }

    pub fn grant_count(&self) -> usize {
        self.grants.lock().len()
    }

    pub fn grant_mode(&self, grant: usize) -> FacingMode {
        self.grants.lock()[grant].0
    }

    /// How many times the stream of the `grant`-th successful request was stopped.
    pub fn stops_of(&self, grant: usize) -> usize {
        self.grants.lock()[grant].1.load(Ordering::SeqCst)
    }

    /// Granted streams not yet stopped.
    pub fn live_streams(&self) -> usize {
        self.grants
            .lock()
            .iter()
            .filter(|(_, stops)| stops.load(Ordering::SeqCst) == 0)
            .count()
    }
}

#[async_trait]
impl CameraDevice for FakeCamera {
    async fn request_stream(
        &self,
        constraints: StreamConstraints,
    ) -> Result<Box<dyn StreamHandle>, DeviceError> {
        self.requests.lock().push(constraints);
        let answer = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let resolution = answer?;
        let stops = Arc::new(AtomicUsize::new(0));
        let shade = {
            let mut grants = self.grants.lock();
            grants.push((constraints.facing, Arc::clone(&stops)));
            grants.len() as u8
        };
        Ok(Box::new(FakeStream {
            resolution,
            shade,
            stops,
            live: true,
        }))
    }
}

/// Leaves the first `stalls` requests hanging forever, like a permission
/// prompt nobody answers, then defers to `inner`.
pub struct StallingCamera {
    pub inner: Arc<FakeCamera>,
    stalls: AtomicUsize,
    /// Notified each time a request starts hanging.
    pub stalled: Notify,
}

impl StallingCamera {
    pub fn new(stalls: usize, inner: Arc<FakeCamera>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            stalls: AtomicUsize::new(stalls),
            stalled: Notify::new(),
        })
    }
}

#[async_trait]
impl CameraDevice for StallingCamera {
    async fn request_stream(
        &self,
        constraints: StreamConstraints,
    ) -> Result<Box<dyn StreamHandle>, DeviceError> {
        let stall = self
            .stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stall {
            self.stalled.notify_one();
            return std::future::pending().await;
        }
        self.inner.request_stream(constraints).await
    }
}

/// Takes `delay` to answer each request, then defers to `inner`.
pub struct SlowCamera {
    pub inner: Arc<FakeCamera>,
    delay: Duration,
}

impl SlowCamera {
    pub fn new(delay: Duration, inner: Arc<FakeCamera>) -> Arc<Self> {
        Arc::new(Self { inner, delay })
    }
}

#[async_trait]
impl CameraDevice for SlowCamera {
    async fn request_stream(
        &self,
        constraints: StreamConstraints,
    ) -> Result<Box<dyn StreamHandle>, DeviceError> {
        tokio::time::sleep(self.delay).await;
        self.inner.request_stream(constraints).await
    }
}

/// One scripted engine call.
pub struct Step {
    pub progress: Vec<EngineProgress>,
    pub outcome: Result<String, EngineError>,
    /// When set, the call blocks after emitting progress until notified.
    pub gate: Option<Arc<Notify>>,
    /// When set, the call panics with this message instead of returning.
    pub panic: Option<String>,
}

impl Step {
    pub fn ok(text: &str) -> Self {
        Self {
            progress: vec![
                EngineProgress::new("initializing api", 0.0),
                EngineProgress::new("recognizing text", 0.5),
                EngineProgress::new("recognizing text", 1.0),
            ],
            outcome: Ok(text.to_string()),
            gate: None,
            panic: None,
        }
    }

    pub fn fail(error: EngineError) -> Self {
        Self {
            progress: vec![EngineProgress::new("initializing api", 0.0)],
            outcome: Err(error),
            gate: None,
            panic: None,
        }
    }

    pub fn panics(message: &str) -> Self {
        Self {
            progress: vec![EngineProgress::new("initializing api", 0.0)],
            outcome: Ok(String::new()),
            gate: None,
            panic: Some(message.to_string()),
        }
    }

    pub fn gated(mut self, gate: &Arc<Notify>) -> Self {
        self.gate = Some(Arc::clone(gate));
        self
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub image: Vec<u8>,
    pub language: String,
}

/// Engine that plays back `Step`s in order. Extra calls succeed with empty text.
pub struct ScriptedEngine {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Call>>,
    pub entered: Notify,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
            entered: Notify::new(),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RecognitionEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn recognize(
        &self,
        image: &[u8],
        language: &str,
        progress: &(dyn Fn(EngineProgress) + Send + Sync),
    ) -> Result<String, EngineError> {
        self.calls.lock().push(Call {
            image: image.to_vec(),
            language: language.to_string(),
        });
        let step = self.steps.lock().pop_front().unwrap_or(Step {
            progress: Vec::new(),
            outcome: Ok(String::new()),
            gate: None,
            panic: None,
        });
        self.entered.notify_one();
        for event in step.progress {
            progress(event);
        }
        if let Some(gate) = step.gate {
            gate.notified().await;
        }
        if let Some(message) = step.panic {
            panic!("{message}");
        }
        step.outcome
    }
}

pub fn session(camera: &Arc<FakeCamera>, engine: &Arc<ScriptedEngine>) -> ScanSession {
    let device: Arc<dyn CameraDevice> = camera.clone();
    session_with(device, engine)
}

pub fn session_with(device: Arc<dyn CameraDevice>, engine: &Arc<ScriptedEngine>) -> ScanSession {
    let engine: Arc<dyn RecognitionEngine> = engine.clone();
    ScanSession::new(ScanConfig::default(), device, engine)
}

/// PNG-encoded solid image.
pub fn png(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba([shade, shade, shade, 255]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

//! scan-ocr: camera/upload capture feeding an OCR engine.
//! Library: pipeline state, capture sources, recognition orchestration.

pub mod cancellation;
pub mod capture;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ocr;
pub mod pipeline;
pub mod state_machine;

pub use capture::camera::{CameraDevice, CameraStatus, FacingMode, NoCamera};
pub use capture::CanonicalImage;
pub use config::ScanConfig;
pub use error::ScanError;
pub use ocr::{EngineError, EngineProgress, RecognitionEngine, TesseractEngine};
pub use pipeline::{JobHandle, JobOutcome, ScanSession};
pub use state_machine::{PipelineState, StatePhase, StateSnapshot};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scan_ocr=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;

use scan_ocr::{
    init_tracing, JobOutcome, NoCamera, PipelineState, ScanConfig, ScanSession, TesseractEngine,
};

/// Recognize text in an image file.
#[derive(Parser, Debug)]
#[command(name = "scan-ocr", version, about)]
struct Args {
    /// Image to recognize (png, jpeg, gif, bmp, webp, tiff).
    image: PathBuf,

    /// Language hint, e.g. `eng` or `eng+deu`.
    #[arg(short, long)]
    lang: Option<String>,

    /// TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the final state snapshot as JSON instead of plain text.
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = ScanConfig::resolve(args.config.as_deref()).context("loading config")?;
    if let Some(lang) = args.lang {
        config.language = lang;
        config.validate().context("validating --lang")?;
    }

    let engine = Arc::new(TesseractEngine::from_config(&config.engine).await);
    if !engine.is_available() {
        bail!(
            "tesseract binary {:?} not found; install it or set {}",
            config.engine.tesseract_bin,
            scan_ocr::config::ENV_TESSERACT
        );
    }

    let session = ScanSession::new(config, Arc::new(NoCamera), engine);
    session
        .upload_path(&args.image)
        .await
        .with_context(|| format!("loading {}", args.image.display()))?;

    let job = session.trigger_recognize().context("starting recognition")?;
    let outcome = job.finished().await;
    info!(?outcome, "recognition finished");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&session.snapshot())?);
    } else if let PipelineState::Recognized { text, .. } = session.state() {
        println!("{text}");
    }

    let failed = match outcome {
        JobOutcome::Applied(Err(e)) => Some(e),
        _ => None,
    };
    session.shutdown();

    if let Some(e) = failed {
        bail!(e);
    }
    Ok(())
}

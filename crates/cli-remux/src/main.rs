mod progress;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use anyhow::{Context, Result};
use clap::Parser;
use indicatif::MultiProgress;
use log::{error, info};
use remux::{LogProgress, PipelineDriver, ProgressReporter, RemuxConfig};

use crate::progress::{BarReporter, SuspendingWriter};

/// Repair badly containerized videos by remuxing them with ffmpeg, one directory per video
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory whose subdirectories each hold one video
    #[arg(default_value = ".")]
    dirname: PathBuf,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log progress instead of drawing progress bars
    #[arg(long)]
    no_progress: bool,
}

/// With bars on screen, log records go through `bars` so they are not drawn over.
fn init_logger(verbose: bool, bars: Option<MultiProgress>) {
    let level = if verbose { "debug" } else { "info" };
    // RUST_LOG wins when set
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    builder.format_timestamp_secs();
    if let Some(multi) = bars {
        builder.target(env_logger::Target::Pipe(Box::new(SuspendingWriter::new(multi))));
    }
    builder.init();
}

fn load_config(args: &Args) -> Result<RemuxConfig> {
    let mut cfg = RemuxConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    cfg.apply_env_overrides();
    cfg.validate().context("Invalid configuration")?;

    info!("Configuration loaded:");
    info!("  ffmpeg: {}", cfg.ffmpeg_bin.display());
    info!("  ffprobe: {}", cfg.ffprobe_bin.display());
    info!("  Video extensions: {:?}", cfg.video_extensions);
    info!("  Blocked codecs: {:?}", cfg.blocked_codecs);
    info!("  Monitor interval: {}ms", cfg.monitor_interval_ms);
    Ok(cfg)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let bars = (!args.no_progress).then(MultiProgress::new);
    init_logger(args.verbose, bars.clone());

    let cfg = match load_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(1);
        }
    };

    let reporter: Arc<dyn ProgressReporter> = match bars {
        Some(multi) => Arc::new(BarReporter::with_multi(multi)),
        None => Arc::new(LogProgress),
    };

    let mut driver = PipelineDriver::new(cfg, reporter);
    match driver.run(&args.dirname).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

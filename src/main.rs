//! Volustream CLI
//!
//! Streams a numbered sequence of compressed point-cloud frames from an
//! HTTP server, decodes them, and plays them back in a loop. Downloads go
//! through an external curl binary; playback is logged by default until a
//! renderer is attached.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use volustream::config::PipelineConfig;
use volustream::control;
use volustream::{CurlFetcher, LogSink, Lz4PointCodec, Pipeline};

/// Volustream - looping volumetric frame-sequence player
#[derive(Parser, Debug)]
#[command(name = "volustream")]
#[command(about = "Stream, decode, and loop a numbered frame sequence")]
#[command(version)]
struct Args {
    /// Optional JSON config file; CLI flags override its values
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Frame server host
    #[arg(long)]
    host: Option<String>,

    /// Frame server port
    #[arg(long)]
    port: Option<u16>,

    /// Quality variant index
    #[arg(long)]
    quality: Option<usize>,

    /// Number of frames in the sequence
    #[arg(long)]
    frames: Option<usize>,

    /// Target playback frame rate
    #[arg(long)]
    fps: Option<f64>,

    /// Target frames per download batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum concurrent download batches
    #[arg(long)]
    max_parallel_batches: Option<usize>,

    /// Maximum concurrent decodes
    #[arg(long)]
    max_parallel_decodes: Option<usize>,

    /// Backpressure cap on buffered frames
    #[arg(long)]
    max_buffered: Option<usize>,

    /// Directory frames are downloaded into
    #[arg(long)]
    download_dir: Option<std::path::PathBuf>,

    /// curl binary to invoke for downloads
    #[arg(long, default_value = "curl")]
    curl: String,

    /// Control-loop tick interval in milliseconds
    #[arg(long, default_value = "5")]
    tick_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Layer CLI flags over the config file (or defaults).
    fn build_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut cfg = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read config {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("cannot parse config {}", path.display()))?
            }
            None => PipelineConfig::default(),
        };

        if let Some(host) = &self.host {
            cfg.source.host = host.clone();
        }
        if let Some(port) = self.port {
            cfg.source.port = port;
        }
        if let Some(quality) = self.quality {
            cfg.source.quality = quality;
        }
        if let Some(frames) = self.frames {
            cfg.frame_count = frames;
        }
        if let Some(fps) = self.fps {
            cfg.fps = fps;
        }
        if let Some(batch) = self.batch_size {
            cfg.batch_size = batch;
        }
        if let Some(slots) = self.max_parallel_batches {
            cfg.max_parallel_batches = slots;
        }
        if let Some(decodes) = self.max_parallel_decodes {
            cfg.max_parallel_decodes = decodes;
        }
        if let Some(cap) = self.max_buffered {
            cfg.max_buffered_frames = Some(cap);
        }
        if let Some(dir) = &self.download_dir {
            cfg.download_dir = dir.clone();
        }
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let cfg = args.build_config()?;

    println!();
    println!("========================================================");
    println!("  Volustream v{}", env!("CARGO_PKG_VERSION"));
    println!("========================================================");
    println!("  Source:    {}", cfg.source.base_url());
    println!("  Sequence:  {} frames @ {} fps", cfg.frame_count, cfg.fps);
    println!("  Batches:   {} x {} (buffer cap {})", cfg.max_parallel_batches, cfg.batch_size, cfg.buffer_cap());
    println!("  Downloads: {}", cfg.download_dir.display());
    println!("  curl:      {}", args.curl);
    println!("  Controls:  host <h> | port <p> | quality <i> | fps <n> | reconnect");
    println!("========================================================");
    println!();

    let fetcher = Arc::new(CurlFetcher::new(args.curl.clone()));
    let pipeline = Pipeline::new(
        cfg,
        fetcher,
        Arc::new(Lz4PointCodec),
        Box::new(LogSink::default()),
    )?;

    // Thin control surface: one command per stdin line.
    let (control_tx, control_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match control::parse_line(&line) {
                Some(cmd) => {
                    if control_tx.send(cmd).is_err() {
                        return;
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!("unrecognized command: {line}"),
            }
        }
        info!("stdin closed, control surface detached");
        // Keep the sender alive so a headless run (no stdin) plays on;
        // dropping it would end the pipeline's run loop.
        std::future::pending::<()>().await;
    });

    pipeline.run(control_rx, Duration::from_millis(args.tick_ms)).await;
    Ok(())
}

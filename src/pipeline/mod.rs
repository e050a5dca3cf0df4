//! Pipeline coordinator: the per-frame state machine and the three
//! schedulers that drive it.
//!
//! Architecture:
//!
//! ```text
//! control loop (one task)            spawned tasks
//! ┌───────────────────────┐         ┌─────────────────┐
//! │ tick()                │  curl   │ fetch batch     │
//! │  1. drain event queue │◄────────│ decode frame    │
//! │  2. download sched    │  events │ pacing delay    │
//! │  3. decode sched      │         └─────────────────┘
//! │  4. playback          │
//! │  5. watchdog          │
//! └───────────────────────┘
//! ```
//!
//! All frame-table mutation happens on the control loop: long-running work
//! reports back through one mpsc queue drained at the top of each tick, so
//! no locking is needed around the registry. Every event carries the
//! session generation it was spawned under; a reset bumps the generation
//! and stale completions are discarded on arrival.

pub mod decode;
pub mod download;
pub mod playback;
pub mod watchdog;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{FrameCodec, PointCloud};
use crate::config::{ConfigError, PipelineConfig};
use crate::control::ControlCommand;
use crate::fetch::Fetcher;
use crate::registry::{FrameRegistry, FrameState};
use crate::sink::RenderSink;

use decode::{DecodeFailure, DecodeScheduler};
use download::DownloadScheduler;
use playback::PlaybackDriver;
use watchdog::StallWatchdog;

/// Completion messages from spawned work, consumed on the next tick.
#[derive(Debug)]
pub enum PipelineEvent {
    /// One curl batch exited (or failed to start, `exit_code != 0`).
    BatchFinished { generation: u64, start: usize, count: usize, exit_code: i32 },
    /// One decode attempt finished.
    FrameDecoded {
        generation: u64,
        index: usize,
        result: Result<PointCloud, DecodeFailure>,
    },
    /// The playback pacing delay ended.
    PacingElapsed { generation: u64 },
}

impl PipelineEvent {
    fn generation(&self) -> u64 {
        match self {
            Self::BatchFinished { generation, .. }
            | Self::FrameDecoded { generation, .. }
            | Self::PacingElapsed { generation } => *generation,
        }
    }
}

/// One playback stream: frame table, schedulers, and collaborators.
pub struct Pipeline {
    cfg: PipelineConfig,
    registry: FrameRegistry,

    download: DownloadScheduler,
    decode: DecodeScheduler,
    playback: PlaybackDriver,
    watchdog: StallWatchdog,

    /// Session epoch; bumped on every reset.
    generation: u64,

    events_tx: UnboundedSender<PipelineEvent>,
    events_rx: UnboundedReceiver<PipelineEvent>,

    fetcher: Arc<dyn Fetcher>,
    codec: Arc<dyn FrameCodec>,
    sink: Box<dyn RenderSink>,

    last_snapshot: Instant,
}

impl Pipeline {
    /// Build a pipeline for a validated configuration. The pipeline must
    /// not start ticking with an invalid config, so validation failures
    /// are fatal here.
    pub fn new(
        cfg: PipelineConfig,
        fetcher: Arc<dyn Fetcher>,
        codec: Arc<dyn FrameCodec>,
        sink: Box<dyn RenderSink>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        ensure_download_dir(&cfg);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = FrameRegistry::build(&cfg);

        info!(
            frames = cfg.frame_count,
            batch_size = cfg.batch_size,
            slots = cfg.max_parallel_batches,
            buffer_cap = cfg.buffer_cap(),
            fps = cfg.fps,
            url = cfg.source.base_url(),
            "pipeline ready"
        );

        Ok(Self {
            cfg,
            registry,
            download: DownloadScheduler::new(),
            decode: DecodeScheduler::new(),
            playback: PlaybackDriver::new(),
            watchdog: StallWatchdog::new(),
            generation: 0,
            events_tx,
            events_rx,
            fetcher,
            codec,
            sink,
            last_snapshot: Instant::now(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn registry(&self) -> &FrameRegistry {
        &self.registry
    }

    pub fn presented(&self) -> u64 {
        self.playback.presented()
    }

    /// One control-loop iteration. Ordering is a deliberate priority
    /// policy: admit new work before consuming existing work.
    pub fn tick(&mut self) {
        self.drain_events();

        self.download.try_schedule(
            &mut self.registry,
            &self.cfg,
            self.fetcher.as_ref(),
            self.generation,
            &self.events_tx,
        );
        self.decode.try_schedule(
            &mut self.registry,
            &self.cfg,
            &self.codec,
            self.generation,
            &self.events_tx,
        );
        self.playback.try_play(
            &mut self.registry,
            &self.cfg,
            self.sink.as_mut(),
            self.generation,
            &self.events_tx,
        );
        self.watchdog.check(&mut self.registry, &self.cfg, &mut self.playback);

        #[cfg(debug_assertions)]
        self.registry.debug_check_counters();

        self.snapshot_if_due();
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            if event.generation() != self.generation {
                trace!(?event, "discarding completion from superseded session");
                continue;
            }
            match event {
                PipelineEvent::BatchFinished { start, count, exit_code, .. } => {
                    self.download.on_batch_finished(&mut self.registry, start, count, exit_code);
                }
                PipelineEvent::FrameDecoded { index, result, .. } => {
                    self.decode.on_decode_finished(&mut self.registry, &self.cfg, index, result);
                }
                PipelineEvent::PacingElapsed { .. } => {
                    self.playback.on_pacing_elapsed();
                }
            }
        }
    }

    /// Tear down the session and start a fresh one under the current
    /// configuration: cancel in-flight work, rebuild the frame table
    /// (releasing all buffers), zero every cursor and counter.
    pub fn reset(&mut self) {
        self.fetcher.cancel_all();
        self.generation += 1;

        self.registry = FrameRegistry::build(&self.cfg);
        self.download.reset();
        self.decode.reset();
        self.playback.reset();
        self.watchdog.reset();
        ensure_download_dir(&self.cfg);

        info!(generation = self.generation, url = self.cfg.source.base_url(), "session reset");
    }

    /// Apply a control command: replace the configuration wholesale and
    /// reset. Rejected commands leave the running session untouched.
    pub fn apply(&mut self, cmd: ControlCommand) -> Result<(), ConfigError> {
        let mut cfg = self.cfg.clone();
        match cmd {
            ControlCommand::SetHost(host) => cfg.source.host = host,
            ControlCommand::SetPort(port) => cfg.source.port = port,
            ControlCommand::SetQuality(index) => cfg.source.quality = index,
            ControlCommand::SetFrameRate(fps) => cfg.fps = fps,
            ControlCommand::Reconnect => {}
        }
        cfg.validate()?;
        self.cfg = cfg;
        self.reset();
        Ok(())
    }

    /// Drive the pipeline until the control channel closes.
    pub async fn run(mut self, mut control: UnboundedReceiver<ControlCommand>, tick: Duration) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                cmd = control.recv() => match cmd {
                    Some(cmd) => {
                        debug!(?cmd, "control command");
                        if let Err(e) = self.apply(cmd) {
                            error!("control command rejected: {e}");
                        }
                    }
                    None => {
                        info!("control channel closed, stopping pipeline");
                        self.fetcher.cancel_all();
                        return;
                    }
                },
            }
        }
    }

    fn snapshot_if_due(&mut self) {
        if self.cfg.snapshot_interval_ms == 0 {
            return;
        }
        let interval = Duration::from_millis(self.cfg.snapshot_interval_ms);
        if self.last_snapshot.elapsed() < interval {
            return;
        }
        self.last_snapshot = Instant::now();
        debug!(
            active_batches = self.download.active_batches(),
            decoding = self.decode.in_flight(),
            none = self.registry.count_state(FrameState::None),
            downloading = self.registry.count_state(FrameState::Downloading),
            downloaded = self.registry.downloaded_count(),
            decoded = self.registry.decoded_count(),
            play_cursor = self.playback.cursor(),
            presented = self.playback.presented(),
            "state"
        );
    }
}

fn ensure_download_dir(cfg: &PipelineConfig) {
    if let Err(e) = std::fs::create_dir_all(&cfg.download_dir) {
        // Downloads will fail and retry; the session itself can survive.
        warn!(dir = %cfg.download_dir.display(), "cannot create download dir: {e}");
    }
}

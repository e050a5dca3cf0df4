//! End-to-end pipeline tests with stub collaborators.
//!
//! The fetcher stub writes real frame files (or deliberately broken ones)
//! and reports batch completion synchronously, so ticking the pipeline is
//! fully deterministic. Time-dependent behavior (pacing, stall watchdog)
//! runs under tokio's paused clock.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use volustream::codec::{encode_frame, Lz4PointCodec};
use volustream::config::PipelineConfig;
use volustream::control::ControlCommand;
use volustream::pipeline::PipelineEvent;
use volustream::registry::FrameState;
use volustream::sink::RenderSink;
use volustream::{FetchBatch, Fetcher, Pipeline, PointCloud};

// ── Stub collaborators ───────────────────────────────────────────────

/// Frame payload for `index`: a cloud with `index + 1` points, so the sink
/// can verify it received the right buffer.
fn frame_bytes(index: usize) -> Vec<u8> {
    let points = index + 1;
    encode_frame(&PointCloud {
        positions: (0..points).map(|p| [p as f32, 0.0, 0.0]).collect(),
        colors: vec![[255, 255, 255, 255]; points],
    })
}

/// Fetch stub: writes destination files and completes batches in-line.
struct StubFetcher {
    /// Batch starts that fail exactly once before succeeding.
    fail_once_starts: Mutex<HashSet<usize>>,
    /// Indices whose file is never written (simulates external cleanup).
    skip: HashSet<usize>,
    /// Indices whose file is written as garbage.
    corrupt: HashSet<usize>,
    /// When set, completions are queued until `flush_held`.
    hold: bool,
    held: Mutex<Vec<(FetchBatch, UnboundedSender<PipelineEvent>)>>,
    /// Every submission as (generation, indices).
    submissions: Mutex<Vec<(u64, Vec<usize>)>>,
}

impl StubFetcher {
    fn new() -> Self {
        Self {
            fail_once_starts: Mutex::new(HashSet::new()),
            skip: HashSet::new(),
            corrupt: HashSet::new(),
            hold: false,
            held: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
        }
    }

    fn submissions(&self) -> Vec<(u64, Vec<usize>)> {
        self.submissions.lock().clone()
    }

    fn flush_held(&self) {
        let held: Vec<_> = self.held.lock().drain(..).collect();
        for (batch, events) in held {
            self.deliver(&batch, &events);
        }
    }

    fn deliver(&self, batch: &FetchBatch, events: &UnboundedSender<PipelineEvent>) {
        if self.fail_once_starts.lock().remove(&batch.start) {
            let _ = events.send(PipelineEvent::BatchFinished {
                generation: batch.generation,
                start: batch.start,
                count: batch.count,
                exit_code: 7,
            });
            return;
        }

        for item in &batch.items {
            if self.skip.contains(&item.index) {
                continue;
            }
            let bytes = if self.corrupt.contains(&item.index) {
                b"not a frame".to_vec()
            } else {
                frame_bytes(item.index)
            };
            std::fs::write(&item.dest, bytes).unwrap();
        }

        let _ = events.send(PipelineEvent::BatchFinished {
            generation: batch.generation,
            start: batch.start,
            count: batch.count,
            exit_code: 0,
        });
    }
}

impl Fetcher for StubFetcher {
    fn submit(&self, batch: FetchBatch, events: UnboundedSender<PipelineEvent>) {
        self.submissions
            .lock()
            .push((batch.generation, batch.items.iter().map(|i| i.index).collect()));
        if self.hold {
            self.held.lock().push((batch, events));
        } else {
            self.deliver(&batch, &events);
        }
    }

    // No-op: a killed curl may still have reported completion, and the
    // pipeline must discard such stale events by generation anyway.
    fn cancel_all(&self) {}
}

/// Sink that records `(index, point_count)` per presentation.
#[derive(Clone, Default)]
struct RecordingSink {
    frames: Arc<Mutex<Vec<(usize, usize)>>>,
}

impl RecordingSink {
    fn indices(&self) -> Vec<usize> {
        self.frames.lock().iter().map(|(i, _)| *i).collect()
    }
}

impl RenderSink for RecordingSink {
    fn present(&mut self, index: usize, frame: PointCloud) {
        self.frames.lock().push((index, frame.point_count()));
    }
}

// ── Harness ──────────────────────────────────────────────────────────

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("volustream-it-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_config(name: &str, n: usize) -> PipelineConfig {
    PipelineConfig {
        frame_count: n,
        batch_size: 3,
        max_parallel_batches: 1,
        max_parallel_decodes: 2,
        max_buffered_frames: Some(n),
        fps: 500.0,
        stall_threshold_ms: 60_000,
        snapshot_interval_ms: 0,
        download_dir: test_dir(name),
        ..Default::default()
    }
}

fn build(cfg: PipelineConfig, fetcher: Arc<StubFetcher>) -> (Pipeline, RecordingSink) {
    let sink = RecordingSink::default();
    let pipeline = Pipeline::new(
        cfg,
        fetcher,
        Arc::new(Lz4PointCodec),
        Box::new(sink.clone()),
    )
    .unwrap();
    (pipeline, sink)
}

/// Tick the control loop, yielding between ticks so spawned decode and
/// pacing tasks can complete under the paused clock.
async fn run_ticks(pipeline: &mut Pipeline, ticks: usize) {
    for _ in 0..ticks {
        pipeline.tick();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

// ── Properties ───────────────────────────────────────────────────────

// N=6, batch 3, one download slot: frames flow through the whole cycle
// and the sequence loops with no index skipped or reordered.
#[tokio::test(start_paused = true)]
async fn scenario_n6_loops_in_strict_order() {
    let fetcher = Arc::new(StubFetcher::new());
    let (mut pipeline, sink) = build(test_config("scenario", 6), fetcher.clone());

    run_ticks(&mut pipeline, 400).await;

    let indices = sink.indices();
    assert!(indices.len() >= 12, "expected at least two laps, got {indices:?}");
    for (k, &index) in indices.iter().enumerate() {
        assert_eq!(index, k % 6, "presentation order diverged at step {k}: {indices:?}");
    }

    // The buffers belong to the indices they were presented under.
    for (index, points) in sink.frames.lock().iter() {
        assert_eq!(*points, index + 1);
    }

    // First submission covered [0, 3): one slot, batch size 3.
    assert_eq!(fetcher.submissions()[0].1, vec![0, 1, 2]);
}

// Repeated ticking drives every index through the full state cycle and
// back to None (looping), given successful collaborators.
#[tokio::test(start_paused = true)]
async fn cycle_invariant_every_slot_recycles() {
    let fetcher = Arc::new(StubFetcher::new());
    let (mut pipeline, sink) = build(test_config("cycle", 4), fetcher.clone());

    run_ticks(&mut pipeline, 300).await;

    let indices = sink.indices();
    for i in 0..4 {
        let hits = indices.iter().filter(|&&x| x == i).count();
        assert!(hits >= 2, "index {i} was not recycled: {indices:?}");
    }
}

// No index is ever referenced by two in-flight batches at once.
#[tokio::test(start_paused = true)]
async fn no_duplicate_batch_assignment() {
    let mut cfg = test_config("dup", 12);
    cfg.max_parallel_batches = 3;
    let fetcher = Arc::new(StubFetcher {
        hold: true, // all batches stay outstanding
        ..StubFetcher::new()
    });
    let (mut pipeline, _sink) = build(cfg, fetcher.clone());

    run_ticks(&mut pipeline, 10).await;

    let submissions = fetcher.submissions();
    assert!(submissions.len() >= 2);
    let mut seen = HashSet::new();
    for (_, indices) in &submissions {
        for &index in indices {
            assert!(seen.insert(index), "index {index} assigned twice: {submissions:?}");
        }
    }
}

// The governor holds the number of non-None slots at or under the cap at
// every tick.
#[tokio::test(start_paused = true)]
async fn backpressure_bound_holds() {
    let mut cfg = test_config("cap", 12);
    cfg.max_parallel_batches = 3;
    cfg.max_buffered_frames = Some(4);
    let fetcher = Arc::new(StubFetcher::new());
    let (mut pipeline, _sink) = build(cfg, fetcher);

    for _ in 0..200 {
        pipeline.tick();
        let reg = pipeline.registry();
        assert!(
            reg.occupied() <= 4,
            "backpressure exceeded: occupied={}",
            reg.occupied()
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

// A batch that fails once is retried and its frames still reach playback.
#[tokio::test(start_paused = true)]
async fn failed_batch_is_retried_and_plays() {
    let fetcher = Arc::new(StubFetcher::new());
    fetcher.fail_once_starts.lock().insert(0);
    let (mut pipeline, sink) = build(test_config("retry", 6), fetcher.clone());

    run_ticks(&mut pipeline, 200).await;

    let indices = sink.indices();
    assert!(indices.len() >= 6, "batch never recovered: {indices:?}");
    assert_eq!(&indices[..3], &[0, 1, 2]);

    // Batch [0, 3) was submitted at least twice: the failure and the retry.
    let zero_batches = fetcher
        .submissions()
        .iter()
        .filter(|(_, idx)| idx.contains(&0))
        .count();
    assert!(zero_batches >= 2);
}

// A frame whose file never materializes stalls the cursor; the watchdog
// skips to the next decoded frame instead of freezing playback.
#[tokio::test(start_paused = true)]
async fn watchdog_skips_unrecoverable_frame() {
    let mut cfg = test_config("stall", 6);
    cfg.stall_threshold_ms = 30;
    let fetcher = Arc::new(StubFetcher {
        skip: HashSet::from([2]),
        ..StubFetcher::new()
    });
    let (mut pipeline, sink) = build(cfg, fetcher);

    run_ticks(&mut pipeline, 300).await;

    let indices = sink.indices();
    assert!(indices.len() >= 5, "playback froze: {indices:?}");
    assert_eq!(&indices[..2], &[0, 1]);
    assert_eq!(indices[2], 3, "watchdog did not skip the stuck frame: {indices:?}");
}

// A permanently corrupt frame is retried a bounded number of times, then
// quarantined from the download pool until the next lap.
#[tokio::test(start_paused = true)]
async fn corrupt_frame_is_quarantined_after_retry_cap() {
    let mut cfg = test_config("poison", 6);
    cfg.max_parallel_batches = 2;
    let fetcher = Arc::new(StubFetcher {
        corrupt: HashSet::from([2]),
        ..StubFetcher::new()
    });
    let (mut pipeline, _sink) = build(cfg, fetcher.clone());

    // Stall threshold stays huge, so the playback cursor parks at 2 and
    // no lap completes to clear the quarantine.
    run_ticks(&mut pipeline, 300).await;

    let downloads_of_2 = fetcher
        .submissions()
        .iter()
        .filter(|(_, idx)| idx.contains(&2))
        .count();
    assert_eq!(
        downloads_of_2,
        pipeline.config().max_decode_retries as usize,
        "quarantine did not bound retries"
    );
    assert_eq!(pipeline.registry().state(2), FrameState::None);
}

// Completions from a superseded session are discarded wholesale.
#[tokio::test(start_paused = true)]
async fn reset_discards_stale_completions() {
    let fetcher = Arc::new(StubFetcher {
        hold: true,
        ..StubFetcher::new()
    });
    let (mut pipeline, _sink) = build(test_config("reset", 6), fetcher.clone());

    run_ticks(&mut pipeline, 2).await;
    assert_eq!(pipeline.registry().count_state(FrameState::Downloading), 3);

    pipeline.apply(ControlCommand::Reconnect).unwrap();
    assert_eq!(pipeline.generation(), 1);
    assert_eq!(pipeline.registry().count_state(FrameState::None), 6);

    // The generation-0 batch lands now; it must change nothing.
    fetcher.flush_held();
    pipeline.tick();
    assert_eq!(pipeline.registry().downloaded_count(), 0);

    // But the new session is scheduling under the new generation.
    let generations: HashSet<u64> =
        fetcher.submissions().iter().map(|(generation, _)| *generation).collect();
    assert!(generations.contains(&1));
}

// An invalid control command is rejected without touching the session.
#[tokio::test(start_paused = true)]
async fn bad_control_command_leaves_session_running() {
    let fetcher = Arc::new(StubFetcher::new());
    let (mut pipeline, sink) = build(test_config("ctrl", 6), fetcher);

    run_ticks(&mut pipeline, 50).await;
    let before = sink.indices().len();
    assert!(before > 0);

    assert!(pipeline.apply(ControlCommand::SetQuality(9)).is_err());
    assert_eq!(pipeline.generation(), 0);

    run_ticks(&mut pipeline, 50).await;
    assert!(sink.indices().len() > before);
}

// Configuration errors are fatal at session start.
#[tokio::test]
async fn invalid_config_refuses_to_start() {
    let cfg = PipelineConfig { frame_count: 0, ..test_config("invalid", 6) };
    let result = Pipeline::new(
        cfg,
        Arc::new(StubFetcher::new()),
        Arc::new(Lz4PointCodec),
        Box::new(RecordingSink::default()),
    );
    assert!(result.is_err());
}

//! Stall watchdog: keeps one missing frame from freezing playback forever.
//!
//! If the playback cursor has not moved for longer than the configured
//! threshold, jump it to the nearest decoded frame further along the ring.
//! The stuck frame keeps its state and is eligible for normal reprocessing;
//! anything skipped over was non-decoded by construction, so a later decode
//! of it simply serves the next lap, still in order modulo N.

use tokio::time::Instant;
use tracing::warn;

use crate::config::PipelineConfig;
use crate::pipeline::playback::PlaybackDriver;
use crate::registry::{FrameRegistry, FrameState};

pub struct StallWatchdog {
    last_cursor: Option<usize>,
    since: Instant,
}

impl StallWatchdog {
    pub fn new() -> Self {
        Self { last_cursor: None, since: Instant::now() }
    }

    pub fn reset(&mut self) {
        self.last_cursor = None;
        self.since = Instant::now();
    }

    /// Observe the cursor; skip ahead when it has been stuck too long.
    pub fn check(
        &mut self,
        reg: &mut FrameRegistry,
        cfg: &PipelineConfig,
        playback: &mut PlaybackDriver,
    ) {
        let cursor = playback.cursor();

        if self.last_cursor != Some(cursor) {
            self.last_cursor = Some(cursor);
            self.since = Instant::now();
            return;
        }

        if self.since.elapsed() < cfg.stall_threshold() {
            return;
        }

        let n = reg.len();
        let target = (1..n)
            .map(|k| (cursor + k) % n)
            .find(|&i| reg.state(i) == FrameState::Decoded);

        match target {
            Some(target) => {
                warn!(stuck = cursor, target, "playback stalled, skipping to next decoded frame");
                if target < cursor {
                    // The skip wrapped past index 0: a lap completed
                    // without a natural wrap, so quarantined assets still
                    // get their fresh chance.
                    reg.reset_decode_failures();
                }
                playback.jump_to(target);
                self.last_cursor = Some(target);
            }
            None => {
                // No decoded frame anywhere: the stall is upstream, there
                // is nothing to skip to.
                warn!(
                    stuck = cursor,
                    downloaded = reg.downloaded_count(),
                    occupied = reg.occupied(),
                    "playback stalled with no decoded frames available"
                );
            }
        }

        // Re-arm either way so the report fires once per threshold period.
        self.since = Instant::now();
    }
}

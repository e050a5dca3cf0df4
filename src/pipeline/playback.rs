//! Playback driver: strict in-order presentation, paced to the target
//! frame interval.
//!
//! Consuming a frame frees its slot back to `None`, which is what lets a
//! finite sequence loop forever: the slot becomes eligible for a fresh
//! download cycle while the cursor wraps around the ring. The pacing delay
//! after each presentation is the only time gate in the whole system.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::PipelineConfig;
use crate::pipeline::PipelineEvent;
use crate::registry::{FrameRegistry, FrameState};
use crate::sink::RenderSink;

pub struct PlaybackDriver {
    cursor: usize,
    /// Cleared on each presentation, set again when the pacing delay ends.
    ready: bool,
    last_present: Instant,
    presented: u64,
}

impl PlaybackDriver {
    pub fn new() -> Self {
        Self { cursor: 0, ready: true, last_present: Instant::now(), presented: 0 }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.ready = true;
        self.last_present = Instant::now();
        self.presented = 0;
    }

    /// Move the cursor directly (watchdog skip). The skipped slots keep
    /// whatever state they had.
    pub fn jump_to(&mut self, index: usize) {
        self.cursor = index;
    }

    /// Present the frame under the cursor if it is decoded and the pacing
    /// gate is open.
    pub fn try_play(
        &mut self,
        reg: &mut FrameRegistry,
        cfg: &PipelineConfig,
        sink: &mut dyn RenderSink,
        generation: u64,
        events: &UnboundedSender<PipelineEvent>,
    ) {
        if !self.ready {
            return;
        }

        let index = self.cursor;
        if reg.state(index) != FrameState::Decoded {
            return;
        }
        let Some(cloud) = reg.take_decoded(index) else {
            return;
        };

        self.ready = false;
        self.presented += 1;
        sink.present(index, cloud);
        trace!(index, "presented frame");

        self.cursor = (index + 1) % reg.len();
        if self.cursor == 0 {
            // Lap boundary: quarantined assets get a fresh chance.
            reg.reset_decode_failures();
            debug!(laps = self.presented / reg.len() as u64, "sequence wrapped");
        }

        self.start_pacing_delay(cfg, generation, events);
    }

    /// The pacing delay ended; the next frame may be presented.
    pub fn on_pacing_elapsed(&mut self) {
        self.last_present = Instant::now();
        self.ready = true;
    }

    fn start_pacing_delay(
        &self,
        cfg: &PipelineConfig,
        generation: u64,
        events: &UnboundedSender<PipelineEvent>,
    ) {
        let interval = cfg.frame_interval();
        let elapsed = self.last_present.elapsed();
        let delay = interval
            .checked_sub(elapsed)
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_millis(1));

        let events = events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(PipelineEvent::PacingElapsed { generation });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PointCloud;
    use tokio::sync::mpsc;

    struct RecordingSink(Vec<usize>);

    impl RenderSink for RecordingSink {
        fn present(&mut self, index: usize, _frame: PointCloud) {
            self.0.push(index);
        }
    }

    fn setup(n: usize) -> (FrameRegistry, PipelineConfig) {
        let cfg = PipelineConfig { frame_count: n, ..Default::default() };
        (FrameRegistry::build(&cfg), cfg)
    }

    fn decode_at(reg: &mut FrameRegistry, index: usize) {
        reg.begin_download(index);
        reg.mark_downloaded(index);
        reg.begin_decode(index);
        reg.store_decoded(
            index,
            PointCloud { positions: vec![[0.0; 3]], colors: vec![[0; 4]] },
        );
    }

    #[tokio::test]
    async fn waits_for_decoded_frame_at_cursor() {
        let (mut reg, cfg) = setup(4);
        decode_at(&mut reg, 1); // not under the cursor

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sink = RecordingSink(Vec::new());
        let mut driver = PlaybackDriver::new();

        driver.try_play(&mut reg, &cfg, &mut sink, 0, &tx);
        assert!(sink.0.is_empty());
        assert_eq!(driver.cursor(), 0);
    }

    #[tokio::test]
    async fn presents_and_frees_slot() {
        let (mut reg, cfg) = setup(4);
        decode_at(&mut reg, 0);

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sink = RecordingSink(Vec::new());
        let mut driver = PlaybackDriver::new();

        driver.try_play(&mut reg, &cfg, &mut sink, 0, &tx);
        assert_eq!(sink.0, vec![0]);
        assert_eq!(reg.state(0), FrameState::None);
        assert_eq!(driver.cursor(), 1);
        reg.debug_check_counters();
    }

    #[tokio::test]
    async fn pacing_gate_blocks_until_delay_elapses() {
        let (mut reg, cfg) = setup(4);
        decode_at(&mut reg, 0);
        decode_at(&mut reg, 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = RecordingSink(Vec::new());
        let mut driver = PlaybackDriver::new();

        driver.try_play(&mut reg, &cfg, &mut sink, 0, &tx);
        // Gate is closed; a second call presents nothing.
        driver.try_play(&mut reg, &cfg, &mut sink, 0, &tx);
        assert_eq!(sink.0, vec![0]);

        // Let the pacing task fire, then reopen the gate.
        let ev = rx.recv().await;
        assert!(matches!(ev, Some(PipelineEvent::PacingElapsed { generation: 0 })));
        driver.on_pacing_elapsed();

        driver.try_play(&mut reg, &cfg, &mut sink, 0, &tx);
        assert_eq!(sink.0, vec![0, 1]);
    }

    #[tokio::test]
    async fn lap_wrap_resets_quarantine() {
        let (mut reg, cfg) = setup(3);
        for _ in 0..3 {
            reg.record_decode_failure(1);
        }
        assert!(reg.is_quarantined(1, cfg.max_decode_retries));

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sink = RecordingSink(Vec::new());
        let mut driver = PlaybackDriver::new();

        decode_at(&mut reg, 0);
        driver.try_play(&mut reg, &cfg, &mut sink, 0, &tx);
        driver.on_pacing_elapsed();

        // Index 1 never decodes; a watchdog skip moves us past it.
        driver.jump_to(2);
        decode_at(&mut reg, 2);
        driver.try_play(&mut reg, &cfg, &mut sink, 0, &tx);

        // Cursor wrapped to 0, so the failure history is gone.
        assert_eq!(driver.cursor(), 0);
        assert!(!reg.is_quarantined(1, cfg.max_decode_retries));
    }
}

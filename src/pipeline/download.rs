//! Download-batch scheduler.
//!
//! Keeps up to `max_parallel_batches` curl batches in flight, each covering
//! a contiguous window of the ring starting at a rotating cursor. The batch
//! size is a target, not a guarantee: indices already past `None` inside
//! the window are skipped, so a batch may transfer fewer files.

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::fetch::{FetchBatch, FetchItem, Fetcher};
use crate::pipeline::PipelineEvent;
use crate::registry::{FrameRegistry, FrameState};

pub struct DownloadScheduler {
    /// Rotating scan start; advanced past each scheduled window, modulo N.
    cursor: usize,
    active_batches: usize,
}

impl DownloadScheduler {
    pub fn new() -> Self {
        Self { cursor: 0, active_batches: 0 }
    }

    pub fn active_batches(&self) -> usize {
        self.active_batches
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.active_batches = 0;
    }

    /// Admit as many new batches as the slot cap and the backpressure
    /// governor allow this tick.
    pub fn try_schedule(
        &mut self,
        reg: &mut FrameRegistry,
        cfg: &PipelineConfig,
        fetcher: &dyn Fetcher,
        generation: u64,
        events: &UnboundedSender<PipelineEvent>,
    ) {
        let n = reg.len();
        let cap = cfg.buffer_cap();
        let base_url = cfg.source.base_url();

        while self.active_batches < cfg.max_parallel_batches && reg.occupied() < cap {
            let Some(start) = self.find_next_none(reg, cfg) else {
                // Nothing occupied and nothing eligible means quarantine
                // has locked out the whole ring; no lap can ever complete
                // to lift it, so lift it here.
                if reg.occupied() == 0 && !reg.is_empty() {
                    warn!("every frame is quarantined, clearing failure history");
                    reg.reset_decode_failures();
                    continue;
                }
                return; // nothing eligible this tick
            };

            // Window clipped at the sequence end and at the governor's room.
            let room = cap - reg.occupied();
            let window = cfg.batch_size.min(room).min(n - start);

            let mut items = Vec::with_capacity(window);
            for index in start..start + window {
                if reg.state(index) != FrameState::None
                    || reg.is_quarantined(index, cfg.max_decode_retries)
                {
                    continue;
                }
                reg.begin_download(index);
                let name = reg.name(index);
                items.push(FetchItem {
                    index,
                    url: format!("{base_url}{name}"),
                    dest: cfg.download_dir.join(name),
                });
            }

            self.cursor = if start + window < n { start + window } else { 0 };

            // `start` itself is always `None`, so the window is never empty.
            debug!(
                start,
                count = window,
                files = items.len(),
                active = self.active_batches + 1,
                "scheduling download batch"
            );

            self.active_batches += 1;
            fetcher.submit(
                FetchBatch { generation, start, count: window, items },
                events.clone(),
            );
        }
    }

    /// Reconcile one finished batch.
    pub fn on_batch_finished(
        &mut self,
        reg: &mut FrameRegistry,
        start: usize,
        count: usize,
        exit_code: i32,
    ) {
        self.active_batches = self.active_batches.saturating_sub(1);

        let end = (start + count).min(reg.len());

        if exit_code != 0 {
            // Failure frees the range for a fresh batch on a later tick;
            // retry/backoff beyond that is curl's own business.
            for index in start..end {
                if reg.state(index) == FrameState::Downloading {
                    reg.revert_to_none(index);
                }
            }
            warn!(start, count, exit_code, "download batch failed, range requeued");
            return;
        }

        let mut marked = 0;
        for index in start..end {
            if reg.mark_downloaded(index) {
                marked += 1;
            }
        }
        debug!(start, count, marked, "download batch complete");
    }

    /// First `None`, non-quarantined index at or after the cursor, wrapping.
    fn find_next_none(&self, reg: &FrameRegistry, cfg: &PipelineConfig) -> Option<usize> {
        let n = reg.len();
        (0..n)
            .map(|k| (self.cursor + k) % n)
            .find(|&i| {
                reg.state(i) == FrameState::None
                    && !reg.is_quarantined(i, cfg.max_decode_retries)
            })
    }
}

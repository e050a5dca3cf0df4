//! Render sink: where decoded frames go.
//!
//! Presentation is fire-and-forget from the pipeline's perspective; the
//! sink must not block the control loop.

use crate::codec::PointCloud;
use tracing::{debug, info};

/// Render sink seam. Receives ownership of each presented buffer; the
/// previously displayed buffer is released when the sink drops it.
pub trait RenderSink: Send {
    fn present(&mut self, index: usize, frame: PointCloud);
}

/// Sink that logs presentations instead of rendering. Useful headless and
/// as the default until a real renderer is attached.
#[derive(Debug, Default)]
pub struct LogSink {
    presented: u64,
}

impl RenderSink for LogSink {
    fn present(&mut self, index: usize, frame: PointCloud) {
        self.presented += 1;
        debug!(index, points = frame.point_count(), "present frame");
        if self.presented % 300 == 0 {
            info!(total = self.presented, "playback running");
        }
    }
}

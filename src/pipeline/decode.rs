//! Decode-concurrency scheduler.
//!
//! Pulls `Downloaded` frames in scan order, bounds how many are decoding at
//! once, and reconciles completions back into the frame table. The actual
//! decode runs in a spawned task: read the downloaded file, feed it to the
//! codec, report the outcome through the event queue.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::codec::{CodecError, FrameCodec};
use crate::config::PipelineConfig;
use crate::pipeline::PipelineEvent;
use crate::registry::{FrameRegistry, FrameState};

/// Why a decode attempt produced no buffer.
#[derive(Debug, Error)]
pub enum DecodeFailure {
    /// File absent despite `Downloaded` state — a race with external
    /// cleanup. Recovered by retrying the decode, not the download.
    #[error("frame file missing")]
    MissingFile,

    #[error("frame file unreadable: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub struct DecodeScheduler {
    /// Rotating scan start, advanced past each claimed index, modulo N.
    cursor: usize,
    in_flight: usize,
}

impl DecodeScheduler {
    pub fn new() -> Self {
        Self { cursor: 0, in_flight: 0 }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.in_flight = 0;
    }

    /// Claim and dispatch as many `Downloaded` frames as the concurrency
    /// cap and the buffered-frame bound allow.
    pub fn try_schedule(
        &mut self,
        reg: &mut FrameRegistry,
        cfg: &PipelineConfig,
        codec: &Arc<dyn FrameCodec>,
        generation: u64,
        events: &UnboundedSender<PipelineEvent>,
    ) {
        while self.in_flight < cfg.max_parallel_decodes && reg.decoded_count() < cfg.buffer_cap() {
            let Some(index) = self.find_downloaded(reg, cfg) else {
                return;
            };

            reg.begin_decode(index);
            self.in_flight += 1;
            self.cursor = (index + 1) % reg.len();

            let path = cfg.download_dir.join(reg.name(index));
            dispatch(index, path, Arc::clone(codec), generation, events.clone());
        }
    }

    /// Reconcile one finished decode.
    pub fn on_decode_finished(
        &mut self,
        reg: &mut FrameRegistry,
        cfg: &PipelineConfig,
        index: usize,
        result: Result<crate::codec::PointCloud, DecodeFailure>,
    ) {
        self.in_flight = self.in_flight.saturating_sub(1);

        if reg.state(index) != FrameState::Decoding {
            // Moved by a concurrent reset; nothing to reconcile.
            return;
        }

        match result {
            Ok(cloud) => {
                debug!(index, points = cloud.point_count(), "decode complete");
                reg.store_decoded(index, cloud);
            }
            Err(DecodeFailure::MissingFile) => {
                warn!(index, "frame file missing, retrying decode later");
                reg.requeue_downloaded(index);
            }
            Err(e) => {
                let failures = reg.record_decode_failure(index);
                reg.revert_to_none(index);
                warn!(index, failures, "decode failed: {e}");
                if failures >= cfg.max_decode_retries {
                    info!(index, "frame quarantined until next playback lap");
                }
            }
        }
    }

    /// First `Downloaded` index near the cursor. A bounded window keeps the
    /// per-tick scan cheap; when the window misses but downloaded frames
    /// exist somewhere, fall back to a full-ring scan.
    fn find_downloaded(&self, reg: &FrameRegistry, cfg: &PipelineConfig) -> Option<usize> {
        let found = self.scan(reg, cfg.decode_scan_window());
        if found.is_none() && reg.downloaded_count() > 0 {
            return self.scan(reg, reg.len());
        }
        found
    }

    fn scan(&self, reg: &FrameRegistry, window: usize) -> Option<usize> {
        let n = reg.len();
        (0..window.min(n))
            .map(|k| (self.cursor + k) % n)
            .find(|&i| reg.state(i) == FrameState::Downloaded)
    }
}

/// Run one decode off the control loop and report back through the queue.
fn dispatch(
    index: usize,
    path: PathBuf,
    codec: Arc<dyn FrameCodec>,
    generation: u64,
    events: UnboundedSender<PipelineEvent>,
) {
    tokio::spawn(async move {
        let result = match tokio::fs::read(&path).await {
            Ok(bytes) => codec.decode(&bytes).map_err(DecodeFailure::from),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DecodeFailure::MissingFile),
            Err(e) => Err(DecodeFailure::Io(e)),
        };
        let _ = events.send(PipelineEvent::FrameDecoded { generation, index, result });
    });
}

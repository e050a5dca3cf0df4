//! Per-frame state table for one streaming session.
//!
//! One slot per logical frame index. State transitions are the only way a
//! slot changes, and every transition keeps the derived counters
//! (`downloaded`, `decoded`, `occupied`) in step with the array. A decoded
//! buffer exists exactly while its slot is `Decoded`; dropping the registry
//! (or any transition away from `Decoded`) releases it.

use crate::codec::PointCloud;
use crate::config::PipelineConfig;

/// Readiness of a single frame slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    None,
    Downloading,
    Downloaded,
    Decoding,
    Decoded,
}

struct FrameSlot {
    state: FrameState,
    buffer: Option<PointCloud>,
    /// Consecutive decode failures since the last success or lap reset.
    decode_failures: u8,
}

/// The ordered frame table, rebuilt wholesale on every (re)connect.
pub struct FrameRegistry {
    names: Vec<String>,
    slots: Vec<FrameSlot>,
    downloaded: usize,
    decoded: usize,
    /// Slots in any non-`None` state (the backpressure governor's measure).
    occupied: usize,
}

impl FrameRegistry {
    /// Build a fresh table with every slot `None`. The config is assumed
    /// validated; an invalid sequence length is a configuration error and
    /// never reaches this point.
    pub fn build(cfg: &PipelineConfig) -> Self {
        let n = cfg.frame_count;
        Self {
            names: (0..n).map(|i| cfg.frame_name(i)).collect(),
            slots: (0..n)
                .map(|_| FrameSlot { state: FrameState::None, buffer: None, decode_failures: 0 })
                .collect(),
            downloaded: 0,
            decoded: 0,
            occupied: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    pub fn state(&self, index: usize) -> FrameState {
        self.slots[index].state
    }

    /// Frames currently `Downloaded` (awaiting decode).
    pub fn downloaded_count(&self) -> usize {
        self.downloaded
    }

    /// Frames currently `Decoded` (buffered for playback).
    pub fn decoded_count(&self) -> usize {
        self.decoded
    }

    /// Frames in any state past `None`.
    pub fn occupied(&self) -> usize {
        self.occupied
    }

    /// Whether this index has failed decoding often enough to be held out
    /// of the download pool until the next playback lap.
    pub fn is_quarantined(&self, index: usize, max_retries: u8) -> bool {
        self.slots[index].decode_failures >= max_retries
    }

    // ── Transitions ──────────────────────────────────────────────

    /// `None → Downloading`: index assigned to an in-flight batch.
    pub fn begin_download(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        debug_assert_eq!(slot.state, FrameState::None);
        slot.state = FrameState::Downloading;
        self.occupied += 1;
    }

    /// `Downloading → Downloaded` on batch success. Returns `false` when
    /// the slot has already been moved by a concurrent reset, so stale
    /// completions are never double-counted.
    pub fn mark_downloaded(&mut self, index: usize) -> bool {
        let slot = &mut self.slots[index];
        if slot.state != FrameState::Downloading {
            return false;
        }
        slot.state = FrameState::Downloaded;
        self.downloaded += 1;
        true
    }

    /// `Downloaded → Decoding`: index claimed by the decode scheduler.
    pub fn begin_decode(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        debug_assert_eq!(slot.state, FrameState::Downloaded);
        slot.state = FrameState::Decoding;
        self.downloaded -= 1;
    }

    /// `Decoding → Downloaded`: the underlying file vanished before the
    /// decoder could read it; the decode attempt is retried later.
    pub fn requeue_downloaded(&mut self, index: usize) -> bool {
        let slot = &mut self.slots[index];
        if slot.state != FrameState::Decoding {
            return false;
        }
        slot.state = FrameState::Downloaded;
        self.downloaded += 1;
        true
    }

    /// `Decoding → Decoded`: store the renderable buffer. Any buffer left
    /// over at this index is released first.
    pub fn store_decoded(&mut self, index: usize, cloud: PointCloud) -> bool {
        let slot = &mut self.slots[index];
        if slot.state != FrameState::Decoding {
            return false;
        }
        slot.buffer = Some(cloud);
        slot.state = FrameState::Decoded;
        slot.decode_failures = 0;
        self.decoded += 1;
        true
    }

    /// `Decoded → None`: hand the buffer to the caller and free the slot
    /// for a new download cycle.
    pub fn take_decoded(&mut self, index: usize) -> Option<PointCloud> {
        let slot = &mut self.slots[index];
        if slot.state != FrameState::Decoded {
            return None;
        }
        let cloud = slot.buffer.take()?;
        slot.state = FrameState::None;
        self.decoded -= 1;
        self.occupied -= 1;
        Some(cloud)
    }

    /// `* → None`: used for batch failures (`Downloading`) and decode
    /// failures (`Decoding`). The index re-enters the download pool.
    pub fn revert_to_none(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        match slot.state {
            FrameState::None => return,
            FrameState::Downloaded => self.downloaded -= 1,
            FrameState::Decoded => self.decoded -= 1,
            FrameState::Downloading | FrameState::Decoding => {}
        }
        slot.buffer = None;
        slot.state = FrameState::None;
        self.occupied -= 1;
    }

    /// Bump the consecutive-failure count for an index; returns the new
    /// count.
    pub fn record_decode_failure(&mut self, index: usize) -> u8 {
        let slot = &mut self.slots[index];
        slot.decode_failures = slot.decode_failures.saturating_add(1);
        slot.decode_failures
    }

    /// Forget all decode-failure history. Called when the playback cursor
    /// completes a lap, giving quarantined assets a fresh chance.
    pub fn reset_decode_failures(&mut self) {
        for slot in &mut self.slots {
            slot.decode_failures = 0;
        }
    }

    /// Recount a state directly from the array. The incremental counters
    /// are authoritative in production; this exists so debug builds can
    /// assert the two never drift.
    pub fn count_state(&self, state: FrameState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }

    #[cfg(debug_assertions)]
    pub fn debug_check_counters(&self) {
        debug_assert_eq!(self.downloaded, self.count_state(FrameState::Downloaded));
        debug_assert_eq!(self.decoded, self.count_state(FrameState::Decoded));
        debug_assert_eq!(self.occupied, self.len() - self.count_state(FrameState::None));
        for slot in &self.slots {
            debug_assert_eq!(slot.state == FrameState::Decoded, slot.buffer.is_some());
        }
    }
}

impl std::fmt::Debug for FrameRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRegistry")
            .field("len", &self.len())
            .field("downloaded", &self.downloaded)
            .field("decoded", &self.decoded)
            .field("occupied", &self.occupied)
            .finish()
    }
}

//! Time-window accumulation of edits into per-chunk batches.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::voxel::chunk::ChunkCoord;
use crate::voxel::density::GridSpec;
use super::delta::{chunks_overlapping, influence_bounds, Brush, EditRecord};

/// Edit batching configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditBatchConfig {
    /// How long edits accumulate before a flush
    pub accumulation_window_ms: u64,
    /// Edit count that forces a flush
    pub max_batch_size: usize,
    /// Brush radius in voxels
    pub brush_radius: f32,
    /// Density change at the brush center when an edit carries none
    pub default_delta: f32,
}

impl Default for EditBatchConfig {
    fn default() -> Self {
        Self {
            accumulation_window_ms: 50,
            max_batch_size: 64,
            brush_radius: 2.0,
            default_delta: 0.5,
        }
    }
}

impl EditBatchConfig {
    pub fn accumulation_window(&self) -> Duration {
        Duration::from_millis(self.accumulation_window_ms)
    }

    pub fn brush(&self) -> Brush {
        Brush {
            radius: self.brush_radius,
            default_delta: self.default_delta,
        }
    }
}

/// Accumulation state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatcherState {
    Idle,
    Accumulating,
    Flushing,
}

/// Edits grouped by every chunk they touch.
///
/// An edit whose brush spans several chunks is listed under each of them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    /// Affected chunks in coordinate order
    pub chunks: Vec<ChunkCoord>,
    pub deltas_by_chunk: BTreeMap<ChunkCoord, Vec<EditRecord>>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Edits listed for one chunk
    pub fn edits_for(&self, coord: ChunkCoord) -> &[EditRecord] {
        self.deltas_by_chunk.get(&coord).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Group `edits` by affected chunk.
    ///
    /// Each edit is listed under the chunks its own brush box reaches, so the
    /// work grows with the number of edits rather than the space between
    /// them. Malformed edits are dropped with a warning.
    pub fn from_edits(edits: &[EditRecord], spec: &GridSpec, brush: &Brush) -> Self {
        if !brush.radius.is_finite() {
            log::warn!("Brush radius {} is not finite, dropping {} edits", brush.radius, edits.len());
            return Self::default();
        }

        let mut deltas_by_chunk: BTreeMap<ChunkCoord, Vec<EditRecord>> = BTreeMap::new();
        for edit in edits {
            if !edit.is_well_formed(spec) {
                log::warn!("Dropping malformed edit {:?}", edit);
                continue;
            }
            let bounds = influence_bounds(edit, spec, brush);
            for coord in chunks_overlapping(&bounds, spec.resolution) {
                deltas_by_chunk.entry(coord).or_default().push(*edit);
            }
        }

        Self {
            chunks: deltas_by_chunk.keys().copied().collect(),
            deltas_by_chunk,
        }
    }
}

/// Accumulates edits from one actor and flushes them as batches.
///
/// Single writer; hand finished batches to the world through a [`BatchSender`]
/// when the batcher lives on another thread.
pub struct EditBatcher {
    config: EditBatchConfig,
    spec: GridSpec,
    pending: Vec<EditRecord>,
    window_start: Option<Instant>,
    state: BatcherState,
    ready: VecDeque<Batch>,
}

impl EditBatcher {
    pub fn new(config: EditBatchConfig, spec: GridSpec) -> Self {
        Self {
            config,
            spec,
            pending: Vec::new(),
            window_start: None,
            state: BatcherState::Idle,
            ready: VecDeque::new(),
        }
    }

    pub fn state(&self) -> BatcherState {
        self.state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn config(&self) -> &EditBatchConfig {
        &self.config
    }

    pub fn submit(&mut self, edit: EditRecord) -> bool {
        self.submit_at(edit, Instant::now())
    }

    /// Append to the current window, starting it when idle.
    ///
    /// Returns false, leaving the window untouched, for an edit with
    /// non-finite values or one outside the editable lattice.
    pub fn submit_at(&mut self, edit: EditRecord, now: Instant) -> bool {
        if !edit.is_well_formed(&self.spec) {
            log::warn!("Rejected malformed edit {:?}", edit);
            return false;
        }
        if self.state == BatcherState::Idle {
            self.window_start = Some(now);
            self.state = BatcherState::Accumulating;
        }
        self.pending.push(edit);
        if self.pending.len() >= self.config.max_batch_size.max(1) {
            let batch = self.flush();
            self.ready.push_back(batch);
        }
        true
    }

    /// Next batch that is due at `now`, if any.
    pub fn poll(&mut self, now: Instant) -> Option<Batch> {
        if let Some(batch) = self.ready.pop_front() {
            return Some(batch);
        }
        let start = self.window_start?;
        if now.saturating_duration_since(start) >= self.config.accumulation_window() {
            Some(self.flush())
        } else {
            None
        }
    }

    /// Force a flush of the current window. An empty window gives an empty batch.
    pub fn flush(&mut self) -> Batch {
        self.state = BatcherState::Flushing;
        let edits = std::mem::take(&mut self.pending);
        let batch = Batch::from_edits(&edits, &self.spec, &self.config.brush());
        if !edits.is_empty() {
            log::debug!(
                "Edit batch flushed: {} edits over {} chunks",
                edits.len(),
                batch.chunks.len()
            );
        }
        self.window_start = None;
        self.state = BatcherState::Idle;
        batch
    }

    /// Flush everything, including batches already cut by size.
    pub fn drain(&mut self) -> Vec<Batch> {
        let mut out: Vec<Batch> = self.ready.drain(..).collect();
        if !self.pending.is_empty() {
            out.push(self.flush());
        }
        out
    }
}

/// Cloneable handle that delivers finished batches to a world.
#[derive(Clone)]
pub struct BatchSender {
    tx: UnboundedSender<Batch>,
}

impl BatchSender {
    pub(crate) fn new(tx: UnboundedSender<Batch>) -> Self {
        Self { tx }
    }

    /// Returns false if the world has shut down.
    pub fn send(&self, batch: Batch) -> bool {
        if batch.is_empty() {
            return true;
        }
        self.tx.send(batch).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;
    use crate::voxel::edit::delta::EditKind;

    fn spec() -> GridSpec {
        GridSpec {
            resolution: 8,
            voxel_size: 1.0,
            surface_level: 0.0,
        }
    }

    fn config() -> EditBatchConfig {
        EditBatchConfig {
            accumulation_window_ms: 100,
            max_batch_size: 4,
            brush_radius: 1.5,
            default_delta: 0.5,
        }
    }

    #[test]
    fn test_window_flush() {
        let mut batcher = EditBatcher::new(config(), spec());
        let t0 = Instant::now();
        assert_eq!(batcher.state(), BatcherState::Idle);

        batcher.submit_at(EditRecord::add(Vec3::new(4.0, 4.0, 4.0)), t0);
        assert_eq!(batcher.state(), BatcherState::Accumulating);
        assert!(batcher.poll(t0 + Duration::from_millis(50)).is_none());

        let batch = batcher.poll(t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(batch.chunks, vec![ChunkCoord::new(0, 0, 0)]);
        assert_eq!(batcher.state(), BatcherState::Idle);
        assert!(batcher.poll(t0 + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn test_empty_flush() {
        let mut batcher = EditBatcher::new(config(), spec());
        let batch = batcher.flush();
        assert!(batch.is_empty());
        assert!(batch.deltas_by_chunk.is_empty());
    }

    #[test]
    fn test_size_flush() {
        let mut batcher = EditBatcher::new(config(), spec());
        let t0 = Instant::now();
        for i in 0..5 {
            batcher.submit_at(EditRecord::add(Vec3::new(2.0 + i as f32 * 0.1, 4.0, 4.0)), t0);
        }
        assert_eq!(batcher.pending_len(), 1);
        let first = batcher.poll(t0).unwrap();
        assert_eq!(first.edits_for(ChunkCoord::new(0, 0, 0)).len(), 4);
        assert!(batcher.poll(t0).is_none());
    }

    #[test]
    fn test_grouping_by_chunk() {
        let mut batcher = EditBatcher::new(config(), spec());
        let t0 = Instant::now();
        // two edits on the x = 8 face, one inside chunk 0
        batcher.submit_at(EditRecord::add(Vec3::new(8.0, 4.0, 4.0)), t0);
        batcher.submit_at(EditRecord::remove(Vec3::new(8.0, 3.0, 4.0)), t0);
        batcher.submit_at(EditRecord::add(Vec3::new(5.0, 4.0, 4.0)), t0);
        let batch = batcher.flush();

        assert_eq!(batch.chunks, vec![ChunkCoord::new(0, 0, 0), ChunkCoord::new(1, 0, 0)]);
        assert_eq!(batch.edits_for(ChunkCoord::new(0, 0, 0)).len(), 3);
        assert_eq!(batch.edits_for(ChunkCoord::new(1, 0, 0)).len(), 2);
    }

    #[test]
    fn test_disjoint_edits_do_not_pull_in_gap_chunks() {
        let mut batcher = EditBatcher::new(config(), spec());
        let t0 = Instant::now();
        batcher.submit_at(EditRecord::add(Vec3::new(4.0, 4.0, 4.0)), t0);
        batcher.submit_at(EditRecord::add(Vec3::new(28.0, 4.0, 4.0)), t0);
        let batch = batcher.flush();
        assert_eq!(batch.chunks, vec![ChunkCoord::new(0, 0, 0), ChunkCoord::new(3, 0, 0)]);
    }

    #[test]
    fn test_batch_sender() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sender = BatchSender::new(tx);
        let batch = Batch::from_edits(
            &[EditRecord::add(Vec3::new(4.0, 4.0, 4.0))],
            &spec(),
            &config().brush(),
        );
        assert!(sender.send(batch.clone()));
        assert_eq!(rx.try_recv().unwrap(), batch);
        drop(rx);
        assert!(!sender.send(batch));
    }

    #[test]
    fn test_distant_edits_touch_only_their_chunks() {
        let edits = [
            EditRecord::add(Vec3::new(4.0, 4.0, 4.0)),
            EditRecord::remove(Vec3::new(1204.0, 1204.0, 1204.0)),
        ];
        let batch = Batch::from_edits(&edits, &spec(), &config().brush());
        assert_eq!(
            batch.chunks,
            vec![ChunkCoord::new(0, 0, 0), ChunkCoord::new(150, 150, 150)]
        );
        assert_eq!(batch.edits_for(ChunkCoord::new(150, 150, 150)), &edits[1..]);
    }

    #[test]
    fn test_malformed_edits_rejected() {
        let mut batcher = EditBatcher::new(config(), spec());
        let t0 = Instant::now();
        let nan_delta = EditRecord::with_delta(Vec3::new(4.0, 4.0, 4.0), EditKind::Add, f32::NAN);
        assert!(!batcher.submit_at(nan_delta, t0));
        assert!(!batcher.submit_at(EditRecord::add(Vec3::new(f32::INFINITY, 0.0, 0.0)), t0));
        assert!(!batcher.submit_at(EditRecord::remove(Vec3::splat(1.0e30)), t0));
        assert_eq!(batcher.state(), BatcherState::Idle);
        assert_eq!(batcher.pending_len(), 0);

        // Batches built directly skip them too
        let batch = Batch::from_edits(
            &[nan_delta, EditRecord::add(Vec3::new(4.0, 4.0, 4.0))],
            &spec(),
            &config().brush(),
        );
        assert_eq!(batch.chunks, vec![ChunkCoord::new(0, 0, 0)]);
        assert_eq!(batch.edits_for(ChunkCoord::new(0, 0, 0)).len(), 1);
    }
}

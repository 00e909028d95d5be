//! The chunk scheduler
//!
//! [`World`] owns the chunk table and is the only writer of chunk status.
//! One call to [`World::tick`] drains store and worker completions, applies
//! edit batches, synchronizes and extracts neighbor batches under the
//! extraction budget, then streams, saves and evicts chunks.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::core::error::Error;
use crate::core::types::{IVec3, Result, Vec3};
use crate::streaming::budget::ExtractionBudget;
use crate::streaming::config::StreamingConfig;
use crate::streaming::planner::plan_extraction;
use crate::streaming::priority::{ChunkPriorityQueue, LoadRange};
use crate::streaming::store::{PersistenceStore, StoreResult};
use crate::streaming::workers::{JobOutput, JobTicket, WorkerPool};
use crate::terrain::{DensitySource, TerrainGenerator};
use crate::voxel::boundary::BoundarySynchronizer;
use crate::voxel::chunk::{Chunk, ChunkBuffers, ChunkCoord, ChunkStatus};
use crate::voxel::density::{DensityGrid, GridSpec};
use crate::voxel::edit::delta::{apply_sample_edit, brush_samples};
use crate::voxel::edit::{Batch, BatchSender, Brush, EditBatcher, EditRecord, ModificationLogEntry};
use crate::voxel::mesh::ChunkMesh;

/// Failed saves after which a chunk is held resident and no longer dispatched
pub const MAX_SAVE_ATTEMPTS: u32 = 2;

/// Notifications for the renderer, networking and other collaborators
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkEvent {
    /// Density became resident (from disk or generation)
    Loaded(ChunkCoord),
    MeshUpdated(ChunkCoord),
    /// Density changed through edits or boundary synchronization
    DataChanged(ChunkCoord),
    Saved(ChunkCoord),
    Unloaded(ChunkCoord),
    /// Terminal failure after the retry was used up
    Failed { coord: ChunkCoord, reason: String },
}

/// What one tick did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Edit batches applied
    pub batches_applied: usize,
    /// Samples changed by edits
    pub samples_edited: usize,
    /// Neighbor batches synchronized and extracted
    pub batches_extracted: usize,
    pub extracted: usize,
    /// Mesh-queued chunks left for a later tick
    pub deferred: usize,
    pub loads_requested: usize,
    pub loaded: usize,
    pub generated: usize,
    pub saves_dispatched: usize,
    pub saved: usize,
    pub evicted: usize,
    pub failed: usize,
    /// Extraction budget used for this tick
    pub budget: usize,
}

impl TickReport {
    /// Add the counters of `other` into `self`.
    pub fn merge(&mut self, other: &TickReport) {
        self.batches_applied += other.batches_applied;
        self.samples_edited += other.samples_edited;
        self.batches_extracted += other.batches_extracted;
        self.extracted += other.extracted;
        self.deferred = other.deferred;
        self.loads_requested += other.loads_requested;
        self.loaded += other.loaded;
        self.generated += other.generated;
        self.saves_dispatched += other.saves_dispatched;
        self.saved += other.saved;
        self.evicted += other.evicted;
        self.failed += other.failed;
        self.budget = other.budget;
    }
}

/// Streamed, editable isosurface world
pub struct World {
    config: StreamingConfig,
    spec: GridSpec,
    brush: Brush,
    source: Arc<dyn DensitySource>,
    store: PersistenceStore,
    workers: WorkerPool,
    sync: BoundarySynchronizer,
    budget: ExtractionBudget,

    chunks: HashMap<ChunkCoord, Chunk>,
    /// Chunks kept resident regardless of observer distance
    pinned: HashSet<ChunkCoord>,
    mesh_queue: BTreeSet<ChunkCoord>,
    /// Split batch remainders and deferred groups that must stay grouped
    carried: Vec<Vec<ChunkCoord>>,
    generation_jobs: HashMap<ChunkCoord, JobTicket>,
    awaiting_generation: VecDeque<ChunkCoord>,
    pending_evictions: HashSet<ChunkCoord>,

    observers: Vec<Vec3>,
    load_queue: ChunkPriorityQueue,

    batcher: EditBatcher,
    incoming: VecDeque<Batch>,
    batch_tx: UnboundedSender<Batch>,
    batch_rx: UnboundedReceiver<Batch>,

    events: VecDeque<ChunkEvent>,
    last_autosave: Instant,
}

impl World {
    /// World over `store` generating terrain from `config.terrain`.
    pub fn new(config: StreamingConfig, store: PersistenceStore) -> Result<Self> {
        let source: Arc<dyn DensitySource> = Arc::new(TerrainGenerator::new(config.terrain.clone()));
        Self::with_source(config, store, source)
    }

    /// World over a store opened from the catalog, using its manifest settings.
    pub fn open(store: PersistenceStore) -> Result<Self> {
        let config = store
            .manifest()
            .map(|m| m.config.clone())
            .ok_or_else(|| Error::InvalidConfig(format!("store at {:?} has no manifest", store.root())))?;
        Self::new(config, store)
    }

    /// World with a custom density source.
    pub fn with_source(
        config: StreamingConfig,
        store: PersistenceStore,
        source: Arc<dyn DensitySource>,
    ) -> Result<Self> {
        config.validate()?;
        if *store.spec() != config.grid {
            return Err(Error::InvalidConfig(format!(
                "store grid {:?} does not match config grid {:?}",
                store.spec(),
                config.grid
            )));
        }
        let workers = WorkerPool::new(
            config.worker_threads,
            Duration::from_millis(config.worker_timeout_ms),
        )?;
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();

        log::info!(
            "World ready: {} samples per chunk axis, {} worker threads, {} logged edits",
            config.grid.samples_per_axis(),
            workers.thread_count(),
            store.edit_log().entry_count()
        );

        Ok(Self {
            spec: config.grid,
            brush: config.edits.brush(),
            budget: ExtractionBudget::new(&config.budget),
            batcher: EditBatcher::new(config.edits.clone(), config.grid),
            config,
            source,
            store,
            workers,
            sync: BoundarySynchronizer::new(),
            chunks: HashMap::new(),
            pinned: HashSet::new(),
            mesh_queue: BTreeSet::new(),
            carried: Vec::new(),
            generation_jobs: HashMap::new(),
            awaiting_generation: VecDeque::new(),
            pending_evictions: HashSet::new(),
            observers: Vec::new(),
            load_queue: ChunkPriorityQueue::new(),
            incoming: VecDeque::new(),
            batch_tx,
            batch_rx,
            events: VecDeque::new(),
            last_autosave: Instant::now(),
        })
    }

    // -- Accessors -----------------------------------------------------------

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    pub fn store(&self) -> &PersistenceStore {
        &self.store
    }

    pub fn chunk(&self, coord: ChunkCoord) -> Option<&Chunk> {
        self.chunks.get(&coord)
    }

    pub fn status(&self, coord: ChunkCoord) -> Option<ChunkStatus> {
        self.chunks.get(&coord).map(Chunk::status)
    }

    /// Chunks in the table, in any state
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn loaded_coords(&self) -> Vec<ChunkCoord> {
        let mut coords: Vec<_> = self
            .chunks
            .values()
            .filter(|c| c.has_buffers())
            .map(|c| c.coord)
            .collect();
        coords.sort();
        coords
    }

    /// Density is resident and readable.
    pub fn is_chunk_loaded(&self, coord: ChunkCoord) -> bool {
        self.chunks.get(&coord).is_some_and(Chunk::has_buffers)
    }

    /// Last extracted mesh of a chunk
    pub fn mesh(&self, coord: ChunkCoord) -> Option<Arc<ChunkMesh>> {
        self.chunks.get(&coord).and_then(Chunk::mesh)
    }

    /// Density of the lattice sample nearest to `pos`, if its chunk is resident.
    pub fn density_at(&self, pos: Vec3) -> Option<f32> {
        let coord = ChunkCoord::from_world_pos(pos, self.spec.chunk_world_size());
        let buffers = self.chunks.get(&coord)?.buffers().ok()?;
        let n = self.spec.resolution as i32;
        let lattice = self.spec.world_to_lattice(pos).round().as_ivec3();
        let local = (lattice - coord.as_ivec3() * n).clamp(IVec3::ZERO, IVec3::splat(n));
        Some(buffers.grid.get(local.x as u32, local.y as u32, local.z as u32))
    }

    pub fn mesh_queue_len(&self) -> usize {
        self.mesh_queue.len()
    }

    /// Groups that must stay grouped in the next extraction plan
    pub fn carried_batches(&self) -> &[Vec<ChunkCoord>] {
        &self.carried
    }

    pub fn extraction_budget(&self) -> &ExtractionBudget {
        &self.budget
    }

    pub fn set_extraction_budget(&mut self, budget: ExtractionBudget) {
        self.budget = budget;
    }

    /// Feed the host's frame time into the adaptive budget.
    pub fn record_frame(&mut self, frame_time: Duration) {
        self.budget.record_frame(frame_time);
    }

    /// Take every event emitted since the last call.
    pub fn drain_events(&mut self) -> Vec<ChunkEvent> {
        self.events.drain(..).collect()
    }

    // -- Requests ------------------------------------------------------------

    /// Positions chunks are streamed around.
    pub fn set_observers(&mut self, observers: &[Vec3]) {
        self.observers = observers.to_vec();
    }

    /// Load `coord` and keep it resident until released or evicted explicitly.
    ///
    /// Returns `false` when the chunk is already in the table.
    pub fn request_chunk(&mut self, coord: ChunkCoord) -> bool {
        self.pinned.insert(coord);
        self.begin_load(coord)
    }

    /// Let observer streaming evict a requested chunk again.
    pub fn release_chunk(&mut self, coord: ChunkCoord) {
        self.pinned.remove(&coord);
    }

    /// Queue an edit in the accumulation window.
    ///
    /// Returns `false` for a malformed edit, which is dropped.
    pub fn submit_edit(&mut self, edit: EditRecord) -> bool {
        self.batcher.submit(edit)
    }

    /// Queue an already grouped batch for the next tick.
    pub fn enqueue_batch(&mut self, batch: Batch) {
        if !batch.is_empty() {
            self.incoming.push_back(batch);
        }
    }

    /// Handle for other threads to deliver batches.
    pub fn batch_sender(&self) -> BatchSender {
        BatchSender::new(self.batch_tx.clone())
    }

    /// Close the accumulation window now and apply everything pending.
    ///
    /// Meshes follow on the next tick. Returns the number of samples changed.
    pub fn flush_edits(&mut self) -> usize {
        let mut report = TickReport::default();
        self.collect_batches(None);
        self.apply_incoming(&mut report);
        report.samples_edited
    }

    // -- Tick ----------------------------------------------------------------

    /// Advance the world by one scheduling step.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport {
            budget: self.budget.current(),
            ..Default::default()
        };

        self.process_store_results(&mut report);
        self.poll_generation(&mut report);
        self.collect_batches(Some(Instant::now()));
        self.apply_incoming(&mut report);
        self.run_extraction(&mut report);
        self.stream_observers(&mut report);
        self.dispatch_generation();
        self.autosave(&mut report);
        self.evict_distant(&mut report);

        if report.extracted > 0 || report.loaded + report.generated > 0 || report.failed > 0 {
            log::debug!(
                "Tick: {} extracted in {} batches, {} deferred, {} loaded, {} generated, {} failed",
                report.extracted,
                report.batches_extracted,
                report.deferred,
                report.loaded,
                report.generated,
                report.failed
            );
        }
        report
    }

    /// No load, generation, save, edit or mesh work is outstanding.
    pub fn is_idle(&self) -> bool {
        self.generation_jobs.is_empty()
            && self.awaiting_generation.is_empty()
            && self.store.pending_count() == 0
            && self.mesh_queue.is_empty()
            && self.incoming.is_empty()
            && self.batcher.pending_len() == 0
            && self.load_queue.is_empty()
    }

    /// Tick until all background work has settled.
    pub fn wait_for_background(&mut self, timeout: Duration) -> Result<TickReport> {
        let started = Instant::now();
        let mut total = TickReport::default();
        loop {
            let report = self.tick();
            total.merge(&report);
            if self.is_idle() {
                return Ok(total);
            }
            if started.elapsed() > timeout {
                return Err(Error::Persistence(format!(
                    "background work still pending after {:?}",
                    timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Persist every chunk with unsaved changes and wait for the store.
    ///
    /// Returns the number of chunks written.
    pub fn save_all(&mut self) -> Result<usize> {
        self.flush_edits();
        let timeout = Duration::from_millis(self.config.worker_timeout_ms.max(1_000) * 4);
        let mut written = 0;

        // A save already in flight may carry an older revision; a second
        // round picks up what it missed.
        for _ in 0..2 {
            let mut report = TickReport::default();
            let dirty: Vec<ChunkCoord> = self
                .chunks
                .values()
                .filter(|c| c.has_unsaved_changes())
                .map(|c| c.coord)
                .collect();
            for coord in dirty {
                self.dispatch_save(coord, &mut report);
            }
            self.store.wait_idle(timeout)?;
            self.process_store_results(&mut report);
            written += report.saved;
            if !self.chunks.values().any(Chunk::has_unsaved_changes) {
                break;
            }
        }

        let left = self.chunks.values().filter(|c| c.has_unsaved_changes()).count();
        if left > 0 {
            log::warn!("save_all: {} chunks still unsaved", left);
        }
        log::info!("Saved {} chunks", written);
        Ok(written)
    }

    /// Drop log entries already baked into saved records.
    pub fn compact_edit_log(&mut self) -> Result<usize> {
        self.store.compact_edit_log()
    }

    /// Save everything and stop background work.
    pub fn shutdown(mut self) -> Result<()> {
        let saved = self.save_all();
        let timeout = Duration::from_millis(self.config.worker_timeout_ms.max(1_000) * 4);
        let closed = self.store.close(timeout);
        log::info!("World shut down");
        saved.and(closed)
    }

    // -- Loading -------------------------------------------------------------

    fn begin_load(&mut self, coord: ChunkCoord) -> bool {
        if self.chunks.contains_key(&coord) {
            return false;
        }
        let mut chunk = Chunk::new(coord);
        chunk.set_status(ChunkStatus::Queued);
        self.chunks.insert(coord, chunk);
        self.store.request_load(coord);
        log::debug!("Chunk {:?}: disk lookup requested", coord);
        true
    }

    fn process_store_results(&mut self, report: &mut TickReport) {
        for result in self.store.poll_results() {
            match result {
                StoreResult::Loaded { coord, record } => {
                    if self.expect_status(coord, ChunkStatus::Queued) {
                        self.install_record(coord, record.buffers, record.applied_sequence);
                        report.loaded += 1;
                    }
                }
                StoreResult::NotFound(coord) => {
                    if self.expect_status(coord, ChunkStatus::Queued) {
                        self.awaiting_generation.push_back(coord);
                    }
                }
                StoreResult::Corrupt { coord, reason } => {
                    log::warn!("Chunk {:?}: corrupt record ({}), regenerating", coord, reason);
                    if self.expect_status(coord, ChunkStatus::Queued) {
                        self.awaiting_generation.push_back(coord);
                    }
                }
                StoreResult::LoadFailed { coord, error } => {
                    log::warn!("Chunk {:?}: disk lookup failed: {}", coord, error);
                    let err = Error::Persistence(error);
                    self.fail_chunk(coord, &err, report);
                }
                StoreResult::Saved { coord, revision, .. } => {
                    if let Some(chunk) = self.chunks.get_mut(&coord) {
                        chunk.mark_saved(revision);
                        settle_after_save(chunk);
                        self.events.push_back(ChunkEvent::Saved(coord));
                    }
                    report.saved += 1;
                }
                StoreResult::SaveFailed { coord, error, .. } => {
                    log::warn!("Chunk {:?}: save failed: {}", coord, error);
                    if let Some(chunk) = self.chunks.get_mut(&coord) {
                        chunk.save_failures += 1;
                        settle_after_save(chunk);
                        if chunk.save_failures >= MAX_SAVE_ATTEMPTS {
                            log::error!(
                                "Chunk {:?}: {} saves failed, holding resident unsaved",
                                coord, chunk.save_failures
                            );
                        }
                    }
                }
            }
        }
    }

    /// True if `coord` is in the table with `status`; stale results are logged.
    fn expect_status(&self, coord: ChunkCoord, status: ChunkStatus) -> bool {
        match self.chunks.get(&coord) {
            Some(chunk) if chunk.status() == status => true,
            Some(chunk) => {
                log::debug!("Chunk {:?}: stale result in status {:?}", coord, chunk.status());
                false
            }
            None => false,
        }
    }

    fn install_record(&mut self, coord: ChunkCoord, buffers: ChunkBuffers, applied_sequence: u64) {
        let Some(chunk) = self.chunks.get_mut(&coord) else {
            return;
        };
        chunk.restore(buffers, applied_sequence);
        chunk.set_status(ChunkStatus::Loaded);
        let replayed = self.replay(coord, applied_sequence);
        log::debug!(
            "Chunk {:?}: loaded from disk (applied seq {}, {} replayed)",
            coord, applied_sequence, replayed
        );
        self.events.push_back(ChunkEvent::Loaded(coord));
        self.queue_mesh(coord);
    }

    fn dispatch_generation(&mut self) {
        while self.generation_jobs.len() < self.config.max_generation_jobs {
            let Some(coord) = self.awaiting_generation.pop_front() else {
                break;
            };
            let Some(chunk) = self.chunks.get_mut(&coord) else {
                continue;
            };
            if chunk.has_modified_data || chunk.has_saved_data {
                log::debug!("Chunk {:?}: holds persistent data, generation skipped", coord);
                continue;
            }
            chunk.set_status(ChunkStatus::GeneratingDensity);
            let ticket = self
                .workers
                .dispatch_generate(coord, self.spec, self.source.clone());
            self.generation_jobs.insert(coord, ticket);
        }
    }

    fn poll_generation(&mut self, report: &mut TickReport) {
        let finished: Vec<(ChunkCoord, Result<JobOutput>)> = self
            .generation_jobs
            .iter()
            .filter_map(|(coord, ticket)| ticket.try_complete().map(|r| (*coord, r)))
            .collect();

        for (coord, result) in finished {
            self.generation_jobs.remove(&coord);
            match result {
                Ok(JobOutput::Generated(buffers)) => {
                    if self.install_generated(coord, buffers) {
                        report.generated += 1;
                    }
                }
                Ok(JobOutput::Extracted { .. }) => {
                    log::error!("Chunk {:?}: generation job returned a mesh", coord);
                }
                Err(e) => self.fail_chunk(coord, &e, report),
            }
        }
    }

    fn install_generated(&mut self, coord: ChunkCoord, buffers: ChunkBuffers) -> bool {
        let Some(chunk) = self.chunks.get_mut(&coord) else {
            return false;
        };
        if chunk.status() != ChunkStatus::GeneratingDensity {
            log::debug!("Chunk {:?}: dropping generated density in {:?}", coord, chunk.status());
            return false;
        }
        // Never overwrite edited or saved density with procedural output
        if chunk.has_modified_data || chunk.has_saved_data {
            log::debug!("Chunk {:?}: holds persistent data, generated density dropped", coord);
            return false;
        }
        chunk.install_buffers(buffers);
        chunk.set_status(ChunkStatus::Loaded);
        let replayed = self.replay(coord, 0);
        log::debug!("Chunk {:?}: generated ({} edits replayed)", coord, replayed);
        self.events.push_back(ChunkEvent::Loaded(coord));
        self.queue_mesh(coord);
        true
    }

    /// Re-apply logged edits newer than `applied_sequence`.
    ///
    /// Entries that do not fit the chunk lattice are skipped.
    fn replay(&mut self, coord: ChunkCoord, applied_sequence: u64) -> usize {
        let resolution = self.spec.resolution;
        let mut entries = self.store.edit_log().entries_after(coord, applied_sequence);
        let before = entries.len();
        entries.retain(|e| e.fits(resolution));
        if entries.len() < before {
            log::warn!(
                "Chunk {:?}: skipped {} log entries outside the lattice",
                coord,
                before - entries.len()
            );
        }
        let Some(last) = entries.last().map(|e| e.sequence) else {
            return 0;
        };
        let Some(chunk) = self.chunks.get_mut(&coord) else {
            return 0;
        };
        let Ok(buffers) = chunk.buffers_mut() else {
            return 0;
        };
        for entry in &entries {
            apply_sample_edit(buffers, &entry.sample_edit());
        }
        chunk.mark_modified(last);
        entries.len()
    }

    // -- Failure -------------------------------------------------------------

    /// Worker or lookup fault: one clean retry, then terminal `Failed`.
    fn fail_chunk(&mut self, coord: ChunkCoord, error: &Error, report: &mut TickReport) {
        let Some(chunk) = self.chunks.get_mut(&coord) else {
            return;
        };
        chunk.set_status(ChunkStatus::Failed);
        chunk.clear_buffers();
        self.mesh_queue.remove(&coord);
        self.generation_jobs.remove(&coord);
        self.pending_evictions.remove(&coord);

        if chunk.retries == 0 {
            // Start over from the store; the log restores committed edits
            let mut fresh = Chunk::new(coord);
            fresh.retries = 1;
            fresh.set_status(ChunkStatus::Queued);
            *chunk = fresh;
            log::warn!("Chunk {:?}: {}; retrying from disk", coord, error);
            self.store.request_load(coord);
        } else {
            log::error!("Chunk {:?}: {}; giving up", coord, error);
            self.events.push_back(ChunkEvent::Failed {
                coord,
                reason: error.to_string(),
            });
            report.failed += 1;
        }
    }

    // -- Edits ---------------------------------------------------------------

    /// Move due batches from the batcher and the channel into `incoming`.
    /// `None` forces the accumulation window closed.
    fn collect_batches(&mut self, now: Option<Instant>) {
        match now {
            Some(now) => {
                while let Some(batch) = self.batcher.poll(now) {
                    self.enqueue_batch(batch);
                }
            }
            None => {
                for batch in self.batcher.drain() {
                    self.enqueue_batch(batch);
                }
            }
        }
        while let Ok(batch) = self.batch_rx.try_recv() {
            self.enqueue_batch(batch);
        }
    }

    fn apply_incoming(&mut self, report: &mut TickReport) {
        while let Some(batch) = self.incoming.pop_front() {
            report.samples_edited += self.apply_batch(&batch);
            report.batches_applied += 1;
        }
    }

    /// Log and apply one batch. Chunks that are not resident get a disk
    /// lookup; their entries are replayed once the density arrives.
    fn apply_batch(&mut self, batch: &Batch) -> usize {
        let mut changed_total = 0;
        for (&coord, records) in &batch.deltas_by_chunk {
            let mut entries: Vec<ModificationLogEntry> = Vec::new();
            for record in records {
                for edit in brush_samples(record, coord, &self.spec, &self.brush) {
                    let sequence = self.store.next_sequence();
                    entries.push(ModificationLogEntry::new(sequence, coord, &edit));
                }
            }
            let Some(last) = entries.last().map(|e| e.sequence) else {
                continue;
            };
            self.store.log_edits(&entries);

            let resident = self
                .chunks
                .get(&coord)
                .is_some_and(|c| c.has_buffers() && !c.status().is_in_flight());
            if !resident {
                if self.begin_load(coord) {
                    log::debug!("Chunk {:?}: edit on non-resident chunk, loading", coord);
                }
                continue;
            }

            let Some(chunk) = self.chunks.get_mut(&coord) else {
                continue;
            };
            let buffers = match chunk.buffers_mut() {
                Ok(b) => b,
                Err(e) => {
                    log::error!("Chunk {:?}: edit aborted: {}", coord, e);
                    continue;
                }
            };
            let changed = entries
                .iter()
                .filter(|e| apply_sample_edit(buffers, &e.sample_edit()))
                .count();
            if changed > 0 {
                chunk.mark_modified(last);
                changed_total += changed;
                self.events.push_back(ChunkEvent::DataChanged(coord));
                self.queue_mesh(coord);
            }
        }
        changed_total
    }

    fn queue_mesh(&mut self, coord: ChunkCoord) {
        let Some(chunk) = self.chunks.get_mut(&coord) else {
            return;
        };
        chunk.is_mesh_update_queued = true;
        if matches!(
            chunk.status(),
            ChunkStatus::Loaded | ChunkStatus::Modified | ChunkStatus::Saving
        ) {
            chunk.set_status(ChunkStatus::QueuedForMesh);
        }
        self.mesh_queue.insert(coord);
    }

    // -- Extraction ----------------------------------------------------------

    fn run_extraction(&mut self, report: &mut TickReport) {
        if self.mesh_queue.is_empty() {
            self.carried.clear();
            return;
        }
        let queued: Vec<ChunkCoord> = self.mesh_queue.iter().copied().collect();
        let plan = plan_extraction(&queued, &self.carried, self.budget.current());
        report.deferred = plan.deferred_count();
        self.carried = plan.carried.clone();

        let mut tickets = Vec::new();
        for batch in &plan.batches {
            let mut owned = self.lend_batch(&batch.chunks);
            if owned.is_empty() {
                continue;
            }
            self.synchronize_batch(&mut owned);
            for (coord, ticket_id, buffers) in owned {
                tickets.push(self.workers.dispatch_extract(
                    ticket_id,
                    coord,
                    buffers,
                    self.spec.voxel_size,
                ));
            }
            report.batches_extracted += 1;
        }

        // Join every extraction before the chunks are touched again
        for ticket in tickets {
            let (coord, ticket_id) = (ticket.coord, ticket.id);
            match ticket.join() {
                Ok(JobOutput::Extracted { buffers, mesh }) => {
                    if self.finish_extraction(coord, ticket_id, buffers, mesh) {
                        report.extracted += 1;
                    }
                }
                Ok(JobOutput::Generated(_)) => {
                    let err = Error::Persistence("extraction job returned density only".into());
                    self.fail_chunk(coord, &err, report);
                }
                Err(e) => self.fail_chunk(coord, &e, report),
            }
        }
    }

    /// Take ownership of the buffers of every batch member.
    fn lend_batch(&mut self, members: &[ChunkCoord]) -> Vec<(ChunkCoord, u64, ChunkBuffers)> {
        let mut owned = Vec::with_capacity(members.len());
        for &coord in members {
            self.mesh_queue.remove(&coord);
            let Some(chunk) = self.chunks.get_mut(&coord) else {
                continue;
            };
            chunk.is_mesh_update_queued = false;
            if !chunk.has_buffers() {
                log::debug!("Chunk {:?}: no density to mesh", coord);
                continue;
            }
            if chunk.status() == ChunkStatus::Saving {
                chunk.set_status(ChunkStatus::QueuedForMesh);
            }
            let ticket_id = self.workers.reserve_ticket();
            match chunk.lend_buffers(ticket_id) {
                Ok(buffers) => {
                    chunk.set_status(ChunkStatus::Meshing);
                    owned.push((coord, ticket_id, buffers));
                }
                Err(e) => log::error!("Chunk {:?}: {}", coord, e),
            }
        }
        owned
    }

    /// Equalize shared faces inside the batch and note seams against
    /// resident neighbors outside it.
    fn synchronize_batch(&mut self, owned: &mut [(ChunkCoord, u64, ChunkBuffers)]) {
        let sync_report = {
            let mut members: Vec<(ChunkCoord, &mut DensityGrid)> = owned
                .iter_mut()
                .map(|(coord, _, buffers)| (*coord, &mut buffers.grid))
                .collect();
            self.sync.synchronize(&mut members)
        };

        for coord in &sync_report.changed_chunks {
            if let Some(chunk) = self.chunks.get_mut(coord) {
                let applied = chunk.applied_sequence();
                chunk.mark_modified(applied);
                self.events.push_back(ChunkEvent::DataChanged(*coord));
            }
        }

        let inside: HashSet<ChunkCoord> = owned.iter().map(|(c, _, _)| *c).collect();
        for (coord, _, buffers) in owned.iter() {
            for neighbor in coord.face_neighbors() {
                if inside.contains(&neighbor) {
                    continue;
                }
                let Some(Ok(other)) = self.chunks.get(&neighbor).map(Chunk::buffers) else {
                    continue;
                };
                let mismatch = self.sync.face_mismatch(*coord, &buffers.grid, neighbor, &other.grid);
                if mismatch > 0 {
                    log::debug!(
                        "Chunk {:?}: {} samples differ from {:?} outside the batch",
                        coord, mismatch, neighbor
                    );
                }
            }
        }
    }

    fn finish_extraction(
        &mut self,
        coord: ChunkCoord,
        ticket_id: u64,
        buffers: ChunkBuffers,
        mesh: ChunkMesh,
    ) -> bool {
        let Some(chunk) = self.chunks.get_mut(&coord) else {
            return false;
        };
        if let Err(e) = chunk.return_buffers(ticket_id, buffers) {
            log::error!("Chunk {:?}: {}", coord, e);
            return false;
        }
        chunk.set_mesh(mesh);
        chunk.retries = 0;
        let next = if chunk.has_unsaved_changes() {
            ChunkStatus::Modified
        } else {
            ChunkStatus::Loaded
        };
        chunk.set_status(next);
        self.events.push_back(ChunkEvent::MeshUpdated(coord));
        true
    }

    // -- Streaming, saving, eviction -----------------------------------------

    fn stream_observers(&mut self, report: &mut TickReport) {
        if self.observers.is_empty() {
            self.load_queue.clear();
            return;
        }
        let range = LoadRange {
            horizontal: self.config.load_radius,
            vertical: self.config.vertical_radius,
        };
        let resident: HashSet<ChunkCoord> = self.chunks.keys().copied().collect();
        self.load_queue
            .update(&self.observers, range, self.spec.chunk_world_size(), &resident);

        let mut dispatched = 0;
        while dispatched < self.config.max_loads_per_tick {
            let Some(next) = self.load_queue.pop() else {
                break;
            };
            if self.begin_load(next.coord) {
                dispatched += 1;
            }
        }
        report.loads_requested += dispatched;
    }

    /// Snapshot an idle chunk with unsaved changes. Returns true if dispatched.
    ///
    /// A chunk whose saves already failed [`MAX_SAVE_ATTEMPTS`] times is not
    /// dispatched again.
    fn dispatch_save(&mut self, coord: ChunkCoord, report: &mut TickReport) -> bool {
        let Some(chunk) = self.chunks.get_mut(&coord) else {
            return false;
        };
        if chunk.save_failures >= MAX_SAVE_ATTEMPTS {
            return false;
        }
        let idle = matches!(
            chunk.status(),
            ChunkStatus::Loaded | ChunkStatus::Modified | ChunkStatus::QueuedForMesh
        );
        if !idle || !chunk.has_buffers() || self.store.is_saving(coord) {
            return false;
        }
        let snapshot = match chunk.snapshot() {
            Ok(s) => s,
            Err(e) => {
                log::error!("Chunk {:?}: snapshot failed: {}", coord, e);
                return false;
            }
        };
        if !self.store.save_snapshot(snapshot) {
            return false;
        }
        chunk.set_status(ChunkStatus::Saving);
        report.saves_dispatched += 1;
        true
    }

    fn autosave(&mut self, report: &mut TickReport) {
        let interval = self.config.autosave_interval_ms;
        if interval == 0 || self.last_autosave.elapsed() < Duration::from_millis(interval) {
            return;
        }
        self.last_autosave = Instant::now();
        let dirty: Vec<ChunkCoord> = self
            .chunks
            .values()
            .filter(|c| c.has_unsaved_changes())
            .map(|c| c.coord)
            .collect();
        for coord in dirty {
            self.dispatch_save(coord, report);
        }
        if report.saves_dispatched > 0 {
            log::debug!("Autosave: {} chunks dispatched", report.saves_dispatched);
        }
    }

    /// Evict `coord` if nothing depends on its resident state.
    ///
    /// A chunk whose only obstacle is unsaved data gets a save dispatched and
    /// is evicted on a later tick once the save is acknowledged. After a failed
    /// save eviction stops dispatching; the retry is left to autosave or
    /// [`World::save_all`] and the chunk stays resident meanwhile.
    pub fn try_evict(&mut self, coord: ChunkCoord) -> bool {
        let carried = self.carried.iter().flatten().any(|c| *c == coord);
        let Some(chunk) = self.chunks.get(&coord) else {
            self.pending_evictions.remove(&coord);
            return false;
        };
        let idle = matches!(
            chunk.status(),
            ChunkStatus::Loaded | ChunkStatus::Modified | ChunkStatus::Failed
        );
        let busy = !idle
            || chunk.is_mesh_update_queued
            || chunk.is_lent()
            || carried
            || self.store.is_loading(coord)
            || self.store.is_saving(coord)
            || self.generation_jobs.contains_key(&coord);
        if busy {
            return false;
        }

        if chunk.has_unsaved_changes() {
            if chunk.save_failures > 0 {
                self.pending_evictions.remove(&coord);
                return false;
            }
            let mut report = TickReport::default();
            if self.dispatch_save(coord, &mut report) {
                self.pending_evictions.insert(coord);
            }
            return false;
        }

        if let Some(mut chunk) = self.chunks.remove(&coord) {
            chunk.set_status(ChunkStatus::Unloaded);
        }
        self.pending_evictions.remove(&coord);
        self.pinned.remove(&coord);
        self.events.push_back(ChunkEvent::Unloaded(coord));
        log::debug!("Chunk {:?}: evicted", coord);
        true
    }

    fn evict_distant(&mut self, report: &mut TickReport) {
        let pending: Vec<ChunkCoord> = self.pending_evictions.iter().copied().collect();
        for coord in pending {
            if self.try_evict(coord) {
                report.evicted += 1;
            }
        }

        if self.observers.is_empty() {
            return;
        }
        let keep = LoadRange {
            horizontal: self.config.unload_radius,
            vertical: self.config.vertical_radius + (self.config.unload_radius - self.config.load_radius),
        };
        let chunk_size = self.spec.chunk_world_size();
        let centers: Vec<ChunkCoord> = self
            .observers
            .iter()
            .map(|o| ChunkCoord::from_world_pos(*o, chunk_size))
            .collect();
        let in_range = |coord: ChunkCoord| centers.iter().any(|c| keep.contains(*c, coord));

        // A pending eviction back in range is cancelled
        self.pending_evictions.retain(|c| !in_range(*c));

        let candidates: Vec<ChunkCoord> = self
            .chunks
            .keys()
            .filter(|c| !self.pinned.contains(*c) && !in_range(**c))
            .copied()
            .collect();
        for coord in candidates {
            if self.try_evict(coord) {
                report.evicted += 1;
            }
        }
    }
}

/// Return a chunk to an idle state after a save completes or fails.
fn settle_after_save(chunk: &mut Chunk) {
    match chunk.status() {
        ChunkStatus::Saving | ChunkStatus::Modified => {
            let next = if chunk.has_unsaved_changes() {
                ChunkStatus::Modified
            } else {
                ChunkStatus::Loaded
            };
            chunk.set_status(next);
        }
        _ => {}
    }
}

//! Chunk system for managing cubic regions of density samples

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::{IVec3, Result, Vec3};
use crate::terrain::DensitySource;
use crate::voxel::density::{DensityGrid, GridSpec};
use crate::voxel::mesh::ChunkMesh;

/// Integer coordinate identifying a chunk in the world grid
///
/// Ordering is x, then y, then z; used wherever iteration order must be stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkCoord {
    /// Create a new chunk coordinate
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn as_ivec3(&self) -> IVec3 {
        IVec3::new(self.x, self.y, self.z)
    }

    /// Convert world position to chunk coordinate
    pub fn from_world_pos(pos: Vec3, chunk_size: f32) -> Self {
        Self {
            x: (pos.x / chunk_size).floor() as i32,
            y: (pos.y / chunk_size).floor() as i32,
            z: (pos.z / chunk_size).floor() as i32,
        }
    }

    /// Get the world-space origin (minimum corner) of this chunk
    pub fn world_origin(&self, chunk_size: f32) -> Vec3 {
        self.as_ivec3().as_vec3() * chunk_size
    }

    /// The six face-adjacent neighbors (-x, +x, -y, +y, -z, +z)
    pub fn face_neighbors(&self) -> [ChunkCoord; 6] {
        let Self { x, y, z } = *self;
        [
            Self::new(x - 1, y, z),
            Self::new(x + 1, y, z),
            Self::new(x, y - 1, z),
            Self::new(x, y + 1, z),
            Self::new(x, y, z - 1),
            Self::new(x, y, z + 1),
        ]
    }

    /// True when the two coordinates differ by exactly one along exactly one axis.
    pub fn is_face_adjacent(&self, other: &ChunkCoord) -> bool {
        self.shared_face_axis(other).is_some()
    }

    /// Axis (0/1/2) of the face shared with `other`, if any.
    pub fn shared_face_axis(&self, other: &ChunkCoord) -> Option<usize> {
        let d = other.as_ivec3() - self.as_ivec3();
        let a = d.abs();
        match (a.x, a.y, a.z) {
            (1, 0, 0) => Some(0),
            (0, 1, 0) => Some(1),
            (0, 0, 1) => Some(2),
            _ => None,
        }
    }
}

/// Lifecycle of a resident chunk. Only the scheduler writes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkStatus {
    Unloaded,
    /// Waiting for the disk lookup or a generation slot
    Queued,
    GeneratingDensity,
    Loaded,
    /// Density differs from the last saved record
    Modified,
    QueuedForMesh,
    Meshing,
    Saving,
    Failed,
}

impl ChunkStatus {
    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Unloaded, Queued) => true,
            (Queued, GeneratingDensity | Loaded | Failed | Unloaded) => true,
            (GeneratingDensity, Loaded | Failed) => true,
            (Loaded, QueuedForMesh | Modified | Saving | Unloaded) => true,
            (Modified, QueuedForMesh | Saving | Loaded) => true,
            (QueuedForMesh, Meshing | Saving) => true,
            (Meshing, Loaded | Modified | Failed) => true,
            (Saving, Loaded | Modified | QueuedForMesh) => true,
            (Failed, Queued | Unloaded) => true,
            _ => false,
        }
    }

    /// A worker or disk lookup may be outstanding in this state.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ChunkStatus::Queued | ChunkStatus::GeneratingDensity | ChunkStatus::Meshing
        )
    }
}

/// The buffers a worker takes ownership of for the duration of a job.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkBuffers {
    pub grid: DensityGrid,
    /// Per-sample hitpoints, same layout as the density samples
    pub durability: Vec<f32>,
}

impl ChunkBuffers {
    pub fn new(grid: DensityGrid, durability: Vec<f32>) -> Self {
        debug_assert_eq!(grid.samples().len(), durability.len());
        Self { grid, durability }
    }

    /// Fresh buffers sampled from a procedural source.
    pub fn generate(coord: ChunkCoord, spec: &GridSpec, source: &dyn DensitySource) -> Self {
        let grid = DensityGrid::generate(coord, spec, source);
        let axis = spec.samples_per_axis() as i32;
        let mut durability = Vec::with_capacity(spec.sample_count());
        for z in 0..axis {
            for y in 0..axis {
                for x in 0..axis {
                    let lattice = spec.lattice_of(coord, IVec3::new(x, y, z));
                    durability.push(source.durability(spec.lattice_to_world(lattice)).clamp(0.0, 1.0));
                }
            }
        }
        Self { grid, durability }
    }
}

/// Where a chunk's buffers currently live.
#[derive(Debug)]
pub enum BufferSlot {
    /// Nothing loaded yet
    Empty,
    Resident(ChunkBuffers),
    /// Owned by an in-flight worker job
    Lent { ticket_id: u64 },
}

/// Copy of a chunk's persistent state handed to the store.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkSnapshot {
    pub coord: ChunkCoord,
    pub buffers: ChunkBuffers,
    /// Highest edit-log sequence already folded into `buffers`
    pub applied_sequence: u64,
    /// Chunk revision the copy was taken at
    pub revision: u64,
}

/// A resident chunk with its density, mesh and lifecycle bookkeeping
pub struct Chunk {
    /// Coordinate of this chunk in the world grid
    pub coord: ChunkCoord,
    status: ChunkStatus,
    slot: BufferSlot,
    mesh: Option<Arc<ChunkMesh>>,
    /// Any density changed since load/generation
    pub has_modified_data: bool,
    /// Data came from or was written to the store
    pub has_saved_data: bool,
    pub is_mesh_update_queued: bool,
    revision: u64,
    saved_revision: u64,
    applied_sequence: u64,
    /// Clean retries used after a worker fault
    pub retries: u32,
    /// Consecutive failed saves
    pub save_failures: u32,
    /// Last time this chunk was accessed (for eviction ordering)
    pub last_access: Instant,
}

impl Chunk {
    /// Create an unloaded chunk with no buffers
    pub fn new(coord: ChunkCoord) -> Self {
        Self {
            coord,
            status: ChunkStatus::Unloaded,
            slot: BufferSlot::Empty,
            mesh: None,
            has_modified_data: false,
            has_saved_data: false,
            is_mesh_update_queued: false,
            revision: 0,
            saved_revision: 0,
            applied_sequence: 0,
            retries: 0,
            save_failures: 0,
            last_access: Instant::now(),
        }
    }

    /// Chunk restored from a persisted record.
    pub fn from_saved(coord: ChunkCoord, buffers: ChunkBuffers, applied_sequence: u64) -> Self {
        let mut chunk = Self::new(coord);
        chunk.slot = BufferSlot::Resident(buffers);
        chunk.has_saved_data = true;
        chunk.applied_sequence = applied_sequence;
        chunk
    }

    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    /// Move to `next`. Invalid transitions are logged and refused.
    pub(crate) fn set_status(&mut self, next: ChunkStatus) -> bool {
        if !self.status.can_transition_to(next) {
            log::error!(
                "Chunk {:?}: refused status transition {:?} -> {:?}",
                self.coord, self.status, next
            );
            return false;
        }
        self.status = next;
        true
    }

    /// Generate density from the procedural source.
    ///
    /// Returns `Ok(false)` without touching any sample when the chunk holds
    /// modified or saved data; regenerating would discard player edits.
    pub fn generate(&mut self, spec: &GridSpec, source: &dyn DensitySource) -> Result<bool> {
        if let BufferSlot::Lent { .. } = self.slot {
            return Err(Error::ConcurrencyHazard {
                coord: self.coord,
                operation: "generate",
            });
        }
        if self.has_modified_data || self.has_saved_data {
            log::debug!("Chunk {:?}: generate skipped, chunk holds persistent data", self.coord);
            return Ok(false);
        }
        self.slot = BufferSlot::Resident(ChunkBuffers::generate(self.coord, spec, source));
        Ok(true)
    }

    /// Install a persisted record into a chunk awaiting its disk lookup.
    pub(crate) fn restore(&mut self, buffers: ChunkBuffers, applied_sequence: u64) {
        self.slot = BufferSlot::Resident(buffers);
        self.has_saved_data = true;
        self.applied_sequence = applied_sequence;
    }

    /// Install buffers produced by a worker or the store.
    pub(crate) fn install_buffers(&mut self, buffers: ChunkBuffers) {
        self.slot = BufferSlot::Resident(buffers);
    }

    pub fn has_buffers(&self) -> bool {
        matches!(self.slot, BufferSlot::Resident(_))
    }

    pub fn is_lent(&self) -> bool {
        matches!(self.slot, BufferSlot::Lent { .. })
    }

    pub fn slot(&self) -> &BufferSlot {
        &self.slot
    }

    /// Read access to resident buffers.
    pub fn buffers(&self) -> Result<&ChunkBuffers> {
        match &self.slot {
            BufferSlot::Resident(b) => Ok(b),
            BufferSlot::Lent { .. } => Err(Error::ConcurrencyHazard {
                coord: self.coord,
                operation: "read buffers",
            }),
            BufferSlot::Empty => Err(Error::Persistence(format!(
                "chunk {:?} has no density loaded",
                self.coord
            ))),
        }
    }

    /// Write access to resident buffers.
    pub fn buffers_mut(&mut self) -> Result<&mut ChunkBuffers> {
        match &mut self.slot {
            BufferSlot::Resident(b) => Ok(b),
            BufferSlot::Lent { .. } => Err(Error::ConcurrencyHazard {
                coord: self.coord,
                operation: "write buffers",
            }),
            BufferSlot::Empty => Err(Error::Persistence(format!(
                "chunk {:?} has no density loaded",
                self.coord
            ))),
        }
    }

    /// Hand the buffers to a worker; the slot becomes `Lent`.
    pub(crate) fn lend_buffers(&mut self, ticket_id: u64) -> Result<ChunkBuffers> {
        match std::mem::replace(&mut self.slot, BufferSlot::Lent { ticket_id }) {
            BufferSlot::Resident(b) => Ok(b),
            other => {
                self.slot = other;
                Err(Error::ConcurrencyHazard {
                    coord: self.coord,
                    operation: "lend buffers",
                })
            }
        }
    }

    /// Take buffers back from a completed job. The ticket must match the loan.
    pub(crate) fn return_buffers(&mut self, ticket_id: u64, buffers: ChunkBuffers) -> Result<()> {
        match self.slot {
            BufferSlot::Lent { ticket_id: lent } if lent == ticket_id => {
                self.slot = BufferSlot::Resident(buffers);
                Ok(())
            }
            _ => Err(Error::ConcurrencyHazard {
                coord: self.coord,
                operation: "return buffers",
            }),
        }
    }

    /// Drop all buffers; used before a clean retry.
    pub(crate) fn clear_buffers(&mut self) {
        self.slot = BufferSlot::Empty;
        self.mesh = None;
        self.has_modified_data = false;
        self.has_saved_data = false;
        self.is_mesh_update_queued = false;
        self.revision = 0;
        self.saved_revision = 0;
        self.applied_sequence = 0;
    }

    /// Record that density changed; bumps the revision.
    pub(crate) fn mark_modified(&mut self, sequence: u64) {
        self.has_modified_data = true;
        self.revision += 1;
        self.applied_sequence = self.applied_sequence.max(sequence);
    }

    /// Record that a snapshot of `revision` reached disk.
    pub(crate) fn mark_saved(&mut self, revision: u64) {
        self.has_saved_data = true;
        self.saved_revision = self.saved_revision.max(revision);
        self.save_failures = 0;
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn saved_revision(&self) -> u64 {
        self.saved_revision
    }

    pub fn applied_sequence(&self) -> u64 {
        self.applied_sequence
    }

    /// True when the in-memory density is ahead of the store.
    pub fn has_unsaved_changes(&self) -> bool {
        self.revision > self.saved_revision
    }

    /// Copy the persistent state for the store.
    pub fn snapshot(&self) -> Result<ChunkSnapshot> {
        let buffers = match &self.slot {
            BufferSlot::Resident(b) => b.clone(),
            BufferSlot::Lent { .. } => {
                return Err(Error::ConcurrencyHazard {
                    coord: self.coord,
                    operation: "snapshot",
                })
            }
            BufferSlot::Empty => {
                return Err(Error::Persistence(format!(
                    "chunk {:?} has nothing to snapshot",
                    self.coord
                )))
            }
        };
        Ok(ChunkSnapshot {
            coord: self.coord,
            buffers,
            applied_sequence: self.applied_sequence,
            revision: self.revision,
        })
    }

    /// Last extracted mesh, shared read-only with the renderer
    pub fn mesh(&self) -> Option<Arc<ChunkMesh>> {
        self.mesh.clone()
    }

    pub(crate) fn set_mesh(&mut self, mesh: ChunkMesh) {
        self.mesh = Some(Arc::new(mesh));
    }

    /// Mark this chunk as recently accessed (updates last_access time)
    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }
}

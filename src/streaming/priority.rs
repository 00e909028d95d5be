//! Priority queue for chunk loading based on observer distance

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::core::types::Vec3;
use crate::voxel::chunk::ChunkCoord;

/// Priority information for a chunk
#[derive(Clone, Copy, Debug)]
pub struct ChunkPriority {
    pub coord: ChunkCoord,
    pub priority: f32, // Higher = more important
    pub distance: f32, // Distance to the nearest observer
}

impl ChunkPriority {
    /// Priority of a chunk for the nearest of `observers`
    pub fn calculate(coord: ChunkCoord, observers: &[Vec3], chunk_size: f32) -> Self {
        let center = coord.world_origin(chunk_size) + Vec3::splat(chunk_size * 0.5);
        let distance = observers
            .iter()
            .map(|o| o.distance(center))
            .fold(f32::INFINITY, f32::min);

        Self {
            coord,
            priority: 1.0 / (distance + 1.0),
            distance,
        }
    }
}

// Implement Ord/PartialOrd for BinaryHeap (max-heap by default)
impl Eq for ChunkPriority {}

impl PartialEq for ChunkPriority {
    fn eq(&self, other: &Self) -> bool {
        self.coord == other.coord
    }
}

impl Ord for ChunkPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        // Use total_cmp for f32 to handle NaN/infinity properly; break ties by
        // coordinate so equal-distance chunks pop in a stable order
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.coord.cmp(&self.coord))
    }
}

impl PartialOrd for ChunkPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Load ring around a set of observers, in chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadRange {
    pub horizontal: i32,
    pub vertical: i32,
}

impl LoadRange {
    /// Whether `coord` lies in the cylinder-like box around `center`.
    pub fn contains(&self, center: ChunkCoord, coord: ChunkCoord) -> bool {
        (coord.x - center.x).abs() <= self.horizontal
            && (coord.z - center.z).abs() <= self.horizontal
            && (coord.y - center.y).abs() <= self.vertical
    }
}

/// Priority queue for chunk loading
pub struct ChunkPriorityQueue {
    heap: BinaryHeap<ChunkPriority>,
    queued: HashSet<ChunkCoord>,
}

impl Default for ChunkPriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkPriorityQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            queued: HashSet::new(),
        }
    }

    /// Clear all queued chunks
    pub fn clear(&mut self) {
        self.heap.clear();
        self.queued.clear();
    }

    /// Add a chunk; duplicates are ignored.
    pub fn push(&mut self, priority: ChunkPriority) {
        if self.queued.insert(priority.coord) {
            self.heap.push(priority);
        }
    }

    /// Get the highest priority chunk
    pub fn pop(&mut self) -> Option<ChunkPriority> {
        let p = self.heap.pop()?;
        self.queued.remove(&p.coord);
        Some(p)
    }

    pub fn contains(&self, coord: ChunkCoord) -> bool {
        self.queued.contains(&coord)
    }

    /// Get the number of queued chunks
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Rebuild the queue with every chunk in range of an observer that is
    /// not already `resident`.
    pub fn update(
        &mut self,
        observers: &[Vec3],
        range: LoadRange,
        chunk_size: f32,
        resident: &HashSet<ChunkCoord>,
    ) {
        self.clear();

        for observer in observers {
            let center = ChunkCoord::from_world_pos(*observer, chunk_size);
            for dx in -range.horizontal..=range.horizontal {
                for dy in -range.vertical..=range.vertical {
                    for dz in -range.horizontal..=range.horizontal {
                        let coord = ChunkCoord::new(center.x + dx, center.y + dy, center.z + dz);

                        // Skip if already loaded or loading
                        if resident.contains(&coord) {
                            continue;
                        }

                        self.push(ChunkPriority::calculate(coord, observers, chunk_size));
                    }
                }
            }
        }
    }
}

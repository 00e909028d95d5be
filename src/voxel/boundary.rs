//! Shared-face equalization between face-adjacent chunks of one batch.

use std::collections::{BTreeSet, HashMap};

use crate::core::types::IVec3;
use crate::voxel::chunk::ChunkCoord;
use crate::voxel::density::DensityGrid;

/// Midpoint of two samples.
///
/// Operands are ordered first so the result does not depend on argument
/// order, equals `a` when `a == b`, and stays within `[min, max]`.
#[inline]
pub fn average(a: f32, b: f32) -> f32 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    lo + (hi - lo) * 0.5
}

/// Order-independent mean of every copy of one shared sample.
///
/// Two copies use [`average`]. More copies are sorted before summing, so any
/// permutation of `values` gives the same bits. Reorders `values`.
pub fn mean(values: &mut [f32]) -> f32 {
    match values.len() {
        0 => 0.0,
        1 => values[0],
        2 => average(values[0], values[1]),
        len => {
            values.sort_by(f32::total_cmp);
            let sum: f64 = values.iter().map(|&v| v as f64).sum();
            let m = (sum / len as f64) as f32;
            m.clamp(values[0], values[len - 1])
        }
    }
}

/// Outcome of one synchronization pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Face-adjacent pairs visited
    pub pairs: usize,
    /// Shared lattice points whose value changed in at least one copy
    pub samples_changed: usize,
    /// Members with at least one changed sample
    pub changed_chunks: BTreeSet<ChunkCoord>,
}

/// Equalizes shared-face samples of face-adjacent chunks within a closed batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct BoundarySynchronizer;

impl BoundarySynchronizer {
    pub fn new() -> Self {
        Self
    }

    /// Equalize every lattice point on a face shared inside `members`.
    ///
    /// A point on an edge or corner can be held by up to eight members; all of
    /// its copies are set to one [`mean`] in a single step, so the result does
    /// not depend on visiting order. Membership is fixed for the call: chunks
    /// outside `members` are never read, written or requeued.
    pub fn synchronize(&self, members: &mut [(ChunkCoord, &mut DensityGrid)]) -> SyncReport {
        members.sort_by_key(|(coord, _)| *coord);

        let mut report = SyncReport::default();
        let Some(n) = members.first().map(|(_, grid)| grid.resolution() as i32) else {
            return report;
        };
        let slots: HashMap<ChunkCoord, usize> = members
            .iter()
            .enumerate()
            .map(|(slot, (coord, _))| (*coord, slot))
            .collect();

        // Global lattice points on faces shared inside the batch
        let mut shared: BTreeSet<[i32; 3]> = BTreeSet::new();
        for (coord, grid) in members.iter() {
            let origin = coord.as_ivec3() * n;
            for axis in 0..3 {
                // face_neighbors: -x, +x, -y, +y, -z, +z
                if !slots.contains_key(&coord.face_neighbors()[2 * axis + 1]) {
                    continue;
                }
                report.pairs += 1;
                for idx in grid.face_indices(axis, true) {
                    let (x, y, z) = grid.position(idx);
                    shared.insert((origin + IVec3::new(x as i32, y as i32, z as i32)).to_array());
                }
            }
        }

        for point in shared {
            let holders = holders_of(IVec3::from_array(point), n, &slots, members);
            let mut values: Vec<f32> = holders
                .iter()
                .map(|&(slot, idx)| members[slot].1.get_index(idx))
                .collect();
            if values.windows(2).all(|w| w[0] == w[1]) {
                continue;
            }

            let m = mean(&mut values);
            let mut changed = false;
            for &(slot, idx) in &holders {
                let (coord, grid) = &mut members[slot];
                if grid.set_index(idx, m) {
                    changed = true;
                    report.changed_chunks.insert(*coord);
                }
            }
            if changed {
                report.samples_changed += 1;
            }
        }

        if report.pairs > 0 {
            log::debug!(
                "Boundary sync: {} chunks, {} pairs, {} samples changed",
                members.len(),
                report.pairs,
                report.samples_changed
            );
        }
        report
    }

    /// Number of shared-face samples that differ between two adjacent grids.
    ///
    /// Returns 0 for coordinates that are not face-adjacent.
    pub fn face_mismatch(
        &self,
        coord_a: ChunkCoord,
        a: &DensityGrid,
        coord_b: ChunkCoord,
        b: &DensityGrid,
    ) -> usize {
        let Some(axis) = coord_a.shared_face_axis(&coord_b) else {
            return 0;
        };
        let (lower, upper) = if coord_a.as_ivec3()[axis] < coord_b.as_ivec3()[axis] {
            (a, b)
        } else {
            (b, a)
        };
        lower
            .face_indices(axis, true)
            .into_iter()
            .zip(upper.face_indices(axis, false))
            .filter(|&(il, iu)| lower.get_index(il) != upper.get_index(iu))
            .count()
    }
}

/// `(member slot, sample index)` of every member holding lattice `point`.
///
/// Along each axis where the point sits on a chunk face it belongs to both
/// the chunk above and the one below, giving at most eight holders.
fn holders_of(
    point: IVec3,
    n: i32,
    slots: &HashMap<ChunkCoord, usize>,
    members: &[(ChunkCoord, &mut DensityGrid)],
) -> Vec<(usize, usize)> {
    let base = point.div_euclid(IVec3::splat(n));
    let mut out = Vec::new();
    for corner in 0..8usize {
        let mut c = base;
        let mut valid = true;
        for axis in 0..3 {
            if (corner >> axis) & 1 == 1 {
                if point[axis].rem_euclid(n) != 0 {
                    valid = false;
                    break;
                }
                c[axis] -= 1;
            }
        }
        if !valid {
            continue;
        }
        let Some(&slot) = slots.get(&ChunkCoord::new(c.x, c.y, c.z)) else {
            continue;
        };
        let local = (point - c * n).as_uvec3();
        out.push((slot, members[slot].1.index(local.x, local.y, local.z)));
    }
    out
}

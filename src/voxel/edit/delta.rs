//! Edit records and the brush that turns them into per-sample deltas.

use serde::{Deserialize, Serialize};

use crate::core::types::{IVec3, Vec3};
use crate::math::Aabb;
use crate::voxel::chunk::{ChunkBuffers, ChunkCoord};
use crate::voxel::density::GridSpec;

/// Direction of a density edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EditKind {
    /// Build: raise density
    Add,
    /// Mine: lower density and wear durability
    Remove,
}

impl EditKind {
    pub fn to_u8(self) -> u8 {
        match self {
            EditKind::Add => 0,
            EditKind::Remove => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EditKind::Add),
            1 => Some(EditKind::Remove),
            _ => None,
        }
    }

    fn sign(self) -> f32 {
        match self {
            EditKind::Add => 1.0,
            EditKind::Remove => -1.0,
        }
    }
}

/// One requested edit. Immutable once created.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditRecord {
    /// Brush center in world space
    pub position: Vec3,
    pub kind: EditKind,
    /// Density change at the brush center; `None` uses the configured default
    pub delta: Option<f32>,
}

impl EditRecord {
    pub fn new(position: Vec3, kind: EditKind) -> Self {
        Self {
            position,
            kind,
            delta: None,
        }
    }

    pub fn with_delta(position: Vec3, kind: EditKind, delta: f32) -> Self {
        Self {
            position,
            kind,
            delta: Some(delta),
        }
    }

    pub fn add(position: Vec3) -> Self {
        Self::new(position, EditKind::Add)
    }

    pub fn remove(position: Vec3) -> Self {
        Self::new(position, EditKind::Remove)
    }

    /// False for edits carrying non-finite values or lying outside the
    /// editable lattice.
    pub fn is_well_formed(&self, spec: &GridSpec) -> bool {
        let lattice = spec.world_to_lattice(self.position);
        lattice.is_finite()
            && lattice.abs().max_element() < MAX_EDIT_LATTICE
            && self.delta.map_or(true, f32::is_finite)
    }
}

/// Largest lattice coordinate an edit may reach; past 2^24 an f32 position
/// no longer resolves single samples.
pub const MAX_EDIT_LATTICE: f32 = 16_777_216.0;

/// Brush parameters shared by every edit in a world.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Brush {
    /// Radius in voxels
    pub radius: f32,
    /// Center delta used when an edit carries none
    pub default_delta: f32,
}

/// A single sample change, as stored in the edit log.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleEdit {
    pub local: [u16; 3],
    pub kind: EditKind,
    /// Unsigned magnitude; `kind` gives the direction
    pub delta: f32,
}

/// Brush box of an edit in lattice units.
pub fn influence_bounds(record: &EditRecord, spec: &GridSpec, brush: &Brush) -> Aabb {
    Aabb::from_sphere(spec.world_to_lattice(record.position), brush.radius)
}

/// Every chunk whose closed sample range `[c*N, c*N+N]` overlaps the lattice box.
///
/// Chunk bounds are computed in `i64`, so boxes near the ends of the `i32`
/// lattice do not overflow.
pub fn chunks_overlapping(bounds: &Aabb, resolution: u32) -> Vec<ChunkCoord> {
    let n = i64::from(resolution.max(1));
    let (lo, hi) = bounds.lattice_range();
    if !lo.cmple(hi).all() {
        return Vec::new();
    }
    let axis = |lo: i32, hi: i32| {
        let c_min = (i64::from(lo) + n - 1).div_euclid(n) - 1;
        let c_max = i64::from(hi).div_euclid(n);
        let clamp = |c: i64| c.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        (clamp(c_min), clamp(c_max))
    };
    let (x0, x1) = axis(lo.x, hi.x);
    let (y0, y1) = axis(lo.y, hi.y);
    let (z0, z1) = axis(lo.z, hi.z);

    let mut out = Vec::new();
    for x in x0..=x1 {
        for y in y0..=y1 {
            for z in z0..=z1 {
                out.push(ChunkCoord::new(x, y, z));
            }
        }
    }
    out
}

/// Samples of `coord` touched by the edit with their weighted deltas.
///
/// Weights come from global lattice positions, so a sample on a shared face
/// receives the same delta in both chunks. Non-finite edits or brushes touch
/// nothing.
pub fn brush_samples(
    record: &EditRecord,
    coord: ChunkCoord,
    spec: &GridSpec,
    brush: &Brush,
) -> Vec<SampleEdit> {
    let mut out = Vec::new();
    let magnitude = record.delta.unwrap_or(brush.default_delta).abs();
    if !record.is_well_formed(spec)
        || !brush.radius.is_finite()
        || !magnitude.is_finite()
        || brush.radius <= 0.0
        || magnitude == 0.0
    {
        return out;
    }

    let center = spec.world_to_lattice(record.position);
    let (lo, hi) = influence_bounds(record, spec, brush).lattice_range();
    let n = spec.resolution as i32;
    let origin = coord.as_ivec3().saturating_mul(IVec3::splat(n));
    let local_lo = lo.saturating_sub(origin).max(IVec3::ZERO);
    let local_hi = hi.saturating_sub(origin).min(IVec3::splat(n));
    for z in local_lo.z..=local_hi.z {
        for y in local_lo.y..=local_hi.y {
            for x in local_lo.x..=local_hi.x {
                let lattice = origin + IVec3::new(x, y, z);
                let d = lattice.as_vec3().distance(center);
                let weight = 1.0 - d / brush.radius;
                if weight <= 0.0 {
                    continue;
                }
                out.push(SampleEdit {
                    local: [x as u16, y as u16, z as u16],
                    kind: record.kind,
                    delta: magnitude * weight,
                });
            }
        }
    }
    out
}

/// Apply one sample change; returns true if density changed.
pub fn apply_sample_edit(buffers: &mut ChunkBuffers, edit: &SampleEdit) -> bool {
    let [x, y, z] = edit.local.map(u32::from);
    let applied = buffers.grid.add(x, y, z, edit.kind.sign() * edit.delta);
    if edit.kind == EditKind::Remove {
        let idx = buffers.grid.index(x, y, z);
        buffers.durability[idx] = (buffers.durability[idx] - edit.delta).max(0.0);
    }
    applied != 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::density::DensityGrid;

    fn spec() -> GridSpec {
        GridSpec {
            resolution: 8,
            voxel_size: 1.0,
            surface_level: 0.0,
        }
    }

    fn brush() -> Brush {
        Brush {
            radius: 1.5,
            default_delta: 0.5,
        }
    }

    #[test]
    fn test_kind_codes() {
        for kind in [EditKind::Add, EditKind::Remove] {
            assert_eq!(EditKind::from_u8(kind.to_u8()), Some(kind));
        }
        assert_eq!(EditKind::from_u8(7), None);
    }

    #[test]
    fn test_interior_edit_touches_one_chunk() {
        let record = EditRecord::add(Vec3::new(4.0, 4.0, 4.0));
        let chunks = chunks_overlapping(&influence_bounds(&record, &spec(), &brush()), 8);
        assert_eq!(chunks, vec![ChunkCoord::new(0, 0, 0)]);
    }

    #[test]
    fn test_face_edit_touches_both_chunks() {
        let record = EditRecord::add(Vec3::new(8.0, 4.0, 4.0));
        let chunks = chunks_overlapping(&influence_bounds(&record, &spec(), &brush()), 8);
        assert_eq!(chunks, vec![ChunkCoord::new(0, 0, 0), ChunkCoord::new(1, 0, 0)]);
    }

    #[test]
    fn test_corner_edit_touches_eight_chunks() {
        let record = EditRecord::remove(Vec3::ZERO);
        let chunks = chunks_overlapping(&influence_bounds(&record, &spec(), &brush()), 8);
        assert_eq!(chunks.len(), 8);
        assert!(chunks.contains(&ChunkCoord::new(-1, -1, -1)));
        assert!(chunks.contains(&ChunkCoord::new(0, 0, 0)));
    }

    #[test]
    fn test_brush_weights() {
        let record = EditRecord::with_delta(Vec3::new(4.0, 4.0, 4.0), EditKind::Add, 1.0);
        let samples = brush_samples(&record, ChunkCoord::new(0, 0, 0), &spec(), &brush());
        let center = samples.iter().find(|s| s.local == [4, 4, 4]).unwrap();
        assert_eq!(center.delta, 1.0);
        let side = samples.iter().find(|s| s.local == [5, 4, 4]).unwrap();
        assert!((side.delta - (1.0 - 1.0 / 1.5)).abs() < 1e-6);
        // 6 axis neighbors at distance 1 and 12 edge neighbors at sqrt(2) < 1.5
        assert_eq!(samples.len(), 1 + 6 + 12);
    }

    #[test]
    fn test_shared_face_samples_get_equal_deltas() {
        let record = EditRecord::add(Vec3::new(8.2, 4.0, 4.0));
        let a = brush_samples(&record, ChunkCoord::new(0, 0, 0), &spec(), &brush());
        let b = brush_samples(&record, ChunkCoord::new(1, 0, 0), &spec(), &brush());
        let a_face: Vec<_> = a.iter().filter(|s| s.local[0] == 8).collect();
        let b_face: Vec<_> = b.iter().filter(|s| s.local[0] == 0).collect();
        assert!(!a_face.is_empty());
        assert_eq!(a_face.len(), b_face.len());
        for (sa, sb) in a_face.iter().zip(&b_face) {
            assert_eq!(&sa.local[1..], &sb.local[1..]);
            assert_eq!(sa.delta, sb.delta);
        }
    }

    #[test]
    fn test_apply_remove_wears_durability() {
        let s = spec();
        let mut buffers = ChunkBuffers::new(DensityGrid::filled(&s, 1.0), vec![1.0; s.sample_count()]);
        let edit = SampleEdit {
            local: [1, 2, 3],
            kind: EditKind::Remove,
            delta: 0.75,
        };
        assert!(apply_sample_edit(&mut buffers, &edit));
        assert_eq!(buffers.grid.get(1, 2, 3), 0.25);
        let idx = buffers.grid.index(1, 2, 3);
        assert_eq!(buffers.durability[idx], 0.25);
    }

    #[test]
    fn test_apply_saturated_is_noop() {
        let s = spec();
        let mut buffers = ChunkBuffers::new(DensityGrid::filled(&s, 1.0), vec![1.0; s.sample_count()]);
        let edit = SampleEdit {
            local: [0, 0, 0],
            kind: EditKind::Add,
            delta: 0.5,
        };
        assert!(!apply_sample_edit(&mut buffers, &edit));
    }

    #[test]
    fn test_well_formed_edits() {
        let s = spec();
        assert!(EditRecord::add(Vec3::new(4.0, -4.0, 1.0e6)).is_well_formed(&s));
        assert!(!EditRecord::add(Vec3::new(f32::NAN, 0.0, 0.0)).is_well_formed(&s));
        assert!(!EditRecord::add(Vec3::new(0.0, f32::INFINITY, 0.0)).is_well_formed(&s));
        assert!(!EditRecord::add(Vec3::splat(1.0e30)).is_well_formed(&s));
        assert!(!EditRecord::with_delta(Vec3::ZERO, EditKind::Remove, f32::NAN).is_well_formed(&s));
        assert!(!EditRecord::with_delta(Vec3::ZERO, EditKind::Add, f32::INFINITY).is_well_formed(&s));
    }

    #[test]
    fn test_malformed_edit_touches_no_samples() {
        let s = spec();
        let nan = EditRecord::with_delta(Vec3::new(4.0, 4.0, 4.0), EditKind::Add, f32::NAN);
        assert!(brush_samples(&nan, ChunkCoord::new(0, 0, 0), &s, &brush()).is_empty());

        let far = EditRecord::add(Vec3::splat(3.0e9));
        let coord = ChunkCoord::new(i32::MAX / 8, i32::MAX / 8, i32::MAX / 8);
        assert!(brush_samples(&far, coord, &s, &brush()).is_empty());

        let wide = Brush {
            radius: f32::INFINITY,
            default_delta: 0.5,
        };
        let ok = EditRecord::add(Vec3::new(4.0, 4.0, 4.0));
        assert!(brush_samples(&ok, ChunkCoord::new(0, 0, 0), &s, &wide).is_empty());
    }

    #[test]
    fn test_chunks_overlapping_at_lattice_extremes() {
        let high = Aabb::new(Vec3::splat(3.0e9), Vec3::splat(3.0e9));
        let chunks = chunks_overlapping(&high, 8);
        assert_eq!(chunks, vec![ChunkCoord::new(i32::MAX / 8, i32::MAX / 8, i32::MAX / 8)]);

        // i32::MIN is a multiple of 8, so the point sits on a face
        let low = Aabb::new(Vec3::splat(-3.0e9), Vec3::splat(-3.0e9));
        assert_eq!(chunks_overlapping(&low, 8).len(), 8);
    }
}

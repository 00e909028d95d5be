//! Per-chunk scalar density samples and their derived active states.
//!
//! A chunk of resolution `N` stores `(N+1)^3` samples so that the samples on
//! each face coincide with the first/last slab of the face-adjacent neighbor.
//! Layout is x-fastest: `idx = x + y*(N+1) + z*(N+1)^2`.

use serde::{Deserialize, Serialize};

use crate::core::types::{IVec3, Vec3};
use crate::terrain::DensitySource;
use crate::voxel::chunk::ChunkCoord;

/// Lowest storable density (fully empty)
pub const MIN_DENSITY: f32 = -1.0;
/// Highest storable density (fully solid)
pub const MAX_DENSITY: f32 = 1.0;

/// Geometry shared by every chunk of a world.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    /// Voxels per chunk side (`N`)
    pub resolution: u32,
    /// World units per voxel
    pub voxel_size: f32,
    /// Threshold separating solid (`>=`) from empty samples
    pub surface_level: f32,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            resolution: 32,
            voxel_size: 1.0,
            surface_level: 0.0,
        }
    }
}

impl GridSpec {
    /// Samples along one axis (`N + 1`)
    pub fn samples_per_axis(&self) -> u32 {
        self.resolution + 1
    }

    /// Total sample count (`(N+1)^3`)
    pub fn sample_count(&self) -> usize {
        let s = self.samples_per_axis() as usize;
        s * s * s
    }

    /// World-space edge length of a chunk
    pub fn chunk_world_size(&self) -> f32 {
        self.resolution as f32 * self.voxel_size
    }

    /// Global lattice position of a chunk-local sample.
    pub fn lattice_of(&self, coord: ChunkCoord, local: IVec3) -> IVec3 {
        coord.as_ivec3() * self.resolution as i32 + local
    }

    /// World position of a global lattice point.
    pub fn lattice_to_world(&self, lattice: IVec3) -> Vec3 {
        lattice.as_vec3() * self.voxel_size
    }

    /// World position converted into (fractional) lattice units.
    pub fn world_to_lattice(&self, pos: Vec3) -> Vec3 {
        pos / self.voxel_size
    }
}

/// Dense density samples plus the per-sample active flag derived from them.
#[derive(Clone, Debug, PartialEq)]
pub struct DensityGrid {
    resolution: u32,
    surface_level: f32,
    samples: Vec<f32>,
    active: Vec<bool>,
}

impl DensityGrid {
    /// Grid with every sample set to `value`.
    pub fn filled(spec: &GridSpec, value: f32) -> Self {
        let value = value.clamp(MIN_DENSITY, MAX_DENSITY);
        Self::from_samples(spec.resolution, spec.surface_level, vec![value; spec.sample_count()])
    }

    /// Build a grid from raw samples.
    ///
    /// # Panics
    /// If `samples.len() != (resolution+1)^3`. Callers decoding untrusted data
    /// must validate the length first.
    pub fn from_samples(resolution: u32, surface_level: f32, samples: Vec<f32>) -> Self {
        let axis = resolution as usize + 1;
        assert_eq!(
            samples.len(),
            axis * axis * axis,
            "density grid of resolution {} needs {} samples",
            resolution,
            axis * axis * axis
        );
        let active = samples.iter().map(|&d| d >= surface_level).collect();
        Self {
            resolution,
            surface_level,
            samples,
            active,
        }
    }

    /// Sample the procedural source for one chunk.
    ///
    /// Pure function of `coord`, `spec` and the (deterministic) source. Sample
    /// positions are computed from the global integer lattice so neighbors
    /// evaluate bit-identical positions on their shared face.
    pub fn generate(coord: ChunkCoord, spec: &GridSpec, source: &dyn DensitySource) -> Self {
        let axis = spec.samples_per_axis() as i32;
        let mut samples = Vec::with_capacity(spec.sample_count());
        for z in 0..axis {
            for y in 0..axis {
                for x in 0..axis {
                    let lattice = spec.lattice_of(coord, IVec3::new(x, y, z));
                    let d = source.density(spec.lattice_to_world(lattice));
                    samples.push(d.clamp(MIN_DENSITY, MAX_DENSITY));
                }
            }
        }
        Self::from_samples(spec.resolution, spec.surface_level, samples)
    }

    /// Voxels per side
    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Samples per side (`resolution + 1`)
    pub fn samples_per_axis(&self) -> u32 {
        self.resolution + 1
    }

    pub fn surface_level(&self) -> f32 {
        self.surface_level
    }

    /// Linear index of a local sample
    #[inline]
    pub fn index(&self, x: u32, y: u32, z: u32) -> usize {
        let axis = self.samples_per_axis() as usize;
        debug_assert!(x < axis as u32 && y < axis as u32 && z < axis as u32);
        x as usize + y as usize * axis + z as usize * axis * axis
    }

    /// Local sample position of a linear index
    pub fn position(&self, index: usize) -> (u32, u32, u32) {
        let axis = self.samples_per_axis() as usize;
        (
            (index % axis) as u32,
            ((index / axis) % axis) as u32,
            (index / (axis * axis)) as u32,
        )
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32, z: u32) -> f32 {
        self.samples[self.index(x, y, z)]
    }

    #[inline]
    pub fn get_index(&self, index: usize) -> f32 {
        self.samples[index]
    }

    /// Set a sample; returns true if the stored value changed.
    pub fn set(&mut self, x: u32, y: u32, z: u32, value: f32) -> bool {
        let idx = self.index(x, y, z);
        self.set_index(idx, value)
    }

    /// Set a sample by linear index; returns true if the stored value changed.
    pub fn set_index(&mut self, index: usize, value: f32) -> bool {
        if value.is_nan() {
            return false;
        }
        let value = value.clamp(MIN_DENSITY, MAX_DENSITY);
        if self.samples[index] == value {
            return false;
        }
        self.samples[index] = value;
        self.active[index] = value >= self.surface_level;
        true
    }

    /// Add `delta` to a sample (clamped); returns the change actually applied.
    pub fn add(&mut self, x: u32, y: u32, z: u32, delta: f32) -> f32 {
        let idx = self.index(x, y, z);
        let before = self.samples[idx];
        self.set_index(idx, before + delta);
        self.samples[idx] - before
    }

    #[inline]
    pub fn is_active(&self, x: u32, y: u32, z: u32) -> bool {
        self.active[self.index(x, y, z)]
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn active_states(&self) -> &[bool] {
        &self.active
    }

    /// Number of solid samples
    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    /// True when every active flag matches its sample under the threshold.
    pub fn states_consistent(&self) -> bool {
        self.samples
            .iter()
            .zip(&self.active)
            .all(|(&d, &a)| (d >= self.surface_level) == a)
    }

    /// Linear indices of the samples on one face, in a stable (u, v) order.
    ///
    /// `axis` is 0/1/2 for x/y/z; `max_side` selects the `N` face instead of `0`.
    /// Two face-adjacent chunks produce matching point orders for their shared face.
    pub fn face_indices(&self, axis: usize, max_side: bool) -> Vec<usize> {
        let axis_len = self.samples_per_axis();
        let fixed = if max_side { self.resolution } else { 0 };
        let mut out = Vec::with_capacity((axis_len * axis_len) as usize);
        for v in 0..axis_len {
            for u in 0..axis_len {
                let (x, y, z) = match axis {
                    0 => (fixed, u, v),
                    1 => (u, fixed, v),
                    _ => (u, v, fixed),
                };
                out.push(self.index(x, y, z));
            }
        }
        out
    }
}

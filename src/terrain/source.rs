//! Procedural density sources

use crate::core::types::Vec3;

/// Deterministic scalar field sampled by chunk generation.
///
/// Implementations run on worker threads and must be pure functions of the
/// position: equal positions give bit-identical results.
pub trait DensitySource: Send + Sync {
    /// Density at a world position; `>= surface_level` is solid.
    fn density(&self, pos: Vec3) -> f32;

    /// Material hitpoints in `[0, 1]` at a world position.
    fn durability(&self, _pos: Vec3) -> f32 {
        1.0
    }
}

/// Flat ground: solid below `height`, density falls linearly across it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaneField {
    pub height: f32,
}

impl PlaneField {
    pub fn new(height: f32) -> Self {
        Self { height }
    }
}

impl DensitySource for PlaneField {
    fn density(&self, pos: Vec3) -> f32 {
        (self.height - pos.y).clamp(-1.0, 1.0)
    }
}

//! Noise-based procedural terrain generation

use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

use super::source::DensitySource;
use crate::core::types::Vec3;

/// Parameters controlling terrain generation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainParams {
    pub seed: u32,
    pub scale: f32,        // Horizontal scale (larger = smoother)
    pub height_scale: f32, // Vertical scale (max height above base)
    pub base_height: f32,  // Height of the lowest valley floor
    pub octaves: u32,      // FBM octaves (detail levels)
    pub persistence: f32,  // FBM persistence (0.5 typical)
    pub lacunarity: f32,   // FBM lacunarity (2.0 typical)
    /// World units over which density ramps from solid to empty at the surface
    pub surface_falloff: f32,
    /// Cave noise scale; 0 disables caves
    pub cave_scale: f32,
    /// Noise band half-width carved out as tunnels
    pub cave_threshold: f32,
    /// Caves start this far below the surface
    pub cave_min_depth: f32,
    /// Depth at which durability reaches 1.0
    pub hardness_depth: f32,
}

impl Default for TerrainParams {
    fn default() -> Self {
        Self {
            seed: 12345,
            scale: 100.0,
            height_scale: 32.0,
            base_height: 0.0,
            octaves: 4,
            persistence: 0.5,
            lacunarity: 2.0,
            surface_falloff: 2.0,
            cave_scale: 24.0,
            cave_threshold: 0.08,
            cave_min_depth: 6.0,
            hardness_depth: 32.0,
        }
    }
}

/// Procedural terrain: FBM heightfield with 3-D Perlin tunnels beneath it
pub struct TerrainGenerator {
    params: TerrainParams,
    noise: Fbm<Perlin>,
    caves: Perlin,
}

impl TerrainGenerator {
    /// Create a new terrain generator with the given parameters
    pub fn new(params: TerrainParams) -> Self {
        let noise = Fbm::<Perlin>::new(params.seed)
            .set_octaves(params.octaves as usize)
            .set_persistence(params.persistence as f64)
            .set_lacunarity(params.lacunarity as f64);
        let caves = Perlin::new(params.seed.wrapping_add(1));

        Self { params, noise, caves }
    }

    /// Get terrain parameters
    pub fn params(&self) -> &TerrainParams {
        &self.params
    }

    /// Get terrain height at world position (x, z)
    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        let nx = (x / self.params.scale) as f64;
        let nz = (z / self.params.scale) as f64;

        // Get noise value in range [-1, 1]
        let noise_value = self.noise.get([nx, nz]).clamp(-1.0, 1.0);

        let normalized = (noise_value + 1.0) / 2.0;
        self.params.base_height + (normalized * self.params.height_scale as f64) as f32
    }

    /// Tunnel field in `[-1, 1]`; negative inside a tunnel.
    fn cave_density(&self, pos: Vec3) -> f32 {
        let s = self.params.cave_scale as f64;
        let v = self.caves.get([pos.x as f64 / s, pos.y as f64 / s, pos.z as f64 / s]) as f32;
        let t = self.params.cave_threshold.max(f32::EPSILON);
        ((v.abs() - t) / t).clamp(-1.0, 1.0)
    }
}

impl DensitySource for TerrainGenerator {
    fn density(&self, pos: Vec3) -> f32 {
        let depth = self.height_at(pos.x, pos.z) - pos.y;
        let surface = (depth / self.params.surface_falloff.max(f32::EPSILON)).clamp(-1.0, 1.0);
        if self.params.cave_scale > 0.0 && depth > self.params.cave_min_depth {
            surface.min(self.cave_density(pos))
        } else {
            surface
        }
    }

    fn durability(&self, pos: Vec3) -> f32 {
        let depth = (self.height_at(pos.x, pos.z) - pos.y).max(0.0);
        (0.25 + 0.75 * depth / self.params.hardness_depth.max(f32::EPSILON)).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terrain_params_default() {
        let params = TerrainParams::default();
        assert_eq!(params.seed, 12345);
        assert_eq!(params.scale, 100.0);
        assert_eq!(params.octaves, 4);
        assert_eq!(params.persistence, 0.5);
        assert_eq!(params.lacunarity, 2.0);
    }

    #[test]
    fn test_height_at() {
        let generator = TerrainGenerator::new(TerrainParams::default());

        let height = generator.height_at(0.0, 0.0);
        assert!(height >= 0.0);
        assert!(height <= 32.0);
        assert_eq!(height, generator.height_at(0.0, 0.0));
    }

    #[test]
    fn test_different_seeds() {
        let gen1 = TerrainGenerator::new(TerrainParams { seed: 1, ..Default::default() });
        let gen2 = TerrainGenerator::new(TerrainParams { seed: 2, ..Default::default() });
        assert_ne!(gen1.height_at(50.0, 50.0), gen2.height_at(50.0, 50.0));
    }

    #[test]
    fn test_density_sign() {
        let generator = TerrainGenerator::new(TerrainParams::default());
        let h = generator.height_at(10.0, 10.0);
        assert_eq!(generator.density(Vec3::new(10.0, h + 50.0, 10.0)), -1.0);
        // just below the surface, above the cave band
        assert!(generator.density(Vec3::new(10.0, h - 1.0, 10.0)) > 0.0);
    }

    #[test]
    fn test_density_is_deterministic() {
        let a = TerrainGenerator::new(TerrainParams::default());
        let b = TerrainGenerator::new(TerrainParams::default());
        for p in [Vec3::new(1.5, -20.0, 3.25), Vec3::new(-40.0, 12.0, 7.0)] {
            assert_eq!(a.density(p), b.density(p));
        }
    }

    #[test]
    fn test_durability_grows_with_depth() {
        let generator = TerrainGenerator::new(TerrainParams::default());
        let h = generator.height_at(0.0, 0.0);
        let shallow = generator.durability(Vec3::new(0.0, h - 1.0, 0.0));
        let deep = generator.durability(Vec3::new(0.0, h - 30.0, 0.0));
        assert!(deep > shallow);
        assert!(deep <= 1.0);
    }
}

//! Streaming configuration.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::terrain::TerrainParams;
use crate::voxel::density::GridSpec;

pub use crate::voxel::edit::EditBatchConfig;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Everything a [`World`](crate::streaming::World) needs besides its store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Chunk geometry.
    pub grid: GridSpec,
    /// Procedural terrain parameters.
    pub terrain: TerrainParams,
    /// Edit accumulation and brush.
    pub edits: EditBatchConfig,
    /// Per-tick extraction budget policy.
    pub budget: BudgetConfig,

    // -- Observer streaming -----------------------------------------------

    /// Horizontal load radius in chunks.
    pub load_radius: i32,
    /// Vertical load radius in chunks.
    pub vertical_radius: i32,
    /// Chunks farther than this (in chunks) become eviction candidates.
    /// Must exceed `load_radius` so chunks do not flap at the border.
    pub unload_radius: i32,
    /// Disk lookups dispatched per tick.
    pub max_loads_per_tick: usize,

    // -- Workers ------------------------------------------------------------

    /// Worker pool size. 0 = number of CPUs.
    pub worker_threads: usize,
    /// Generation jobs allowed in flight at once.
    pub max_generation_jobs: usize,
    /// A worker exceeding this is treated as a fatal fault.
    pub worker_timeout_ms: u64,

    // -- Persistence ----------------------------------------------------------

    /// Interval between autosaves of modified chunks. 0 = disabled.
    pub autosave_interval_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            grid: GridSpec::default(),
            terrain: TerrainParams::default(),
            edits: EditBatchConfig::default(),
            budget: BudgetConfig::default(),
            load_radius: 4,
            vertical_radius: 2,
            unload_radius: 6,
            max_loads_per_tick: 8,
            worker_threads: 0,
            max_generation_jobs: 8,
            worker_timeout_ms: 5_000,
            autosave_interval_ms: 10_000,
        }
    }
}

impl StreamingConfig {
    /// Check ranges that would break streaming invariants.
    pub fn validate(&self) -> Result<()> {
        if self.grid.resolution == 0 || self.grid.resolution + 1 > u16::MAX as u32 {
            return Err(Error::InvalidConfig(format!(
                "grid.resolution must be in 1..{}, got {}",
                u16::MAX,
                self.grid.resolution
            )));
        }
        if !(self.grid.voxel_size > 0.0) {
            return Err(Error::InvalidConfig("grid.voxel_size must be positive".into()));
        }
        if !(-1.0..=1.0).contains(&self.grid.surface_level) {
            return Err(Error::InvalidConfig("grid.surface_level must lie in [-1, 1]".into()));
        }
        if self.load_radius < 0 || self.vertical_radius < 0 {
            return Err(Error::InvalidConfig("load radii must be non-negative".into()));
        }
        if self.unload_radius <= self.load_radius {
            return Err(Error::InvalidConfig(format!(
                "unload_radius ({}) must exceed load_radius ({})",
                self.unload_radius, self.load_radius
            )));
        }
        if self.edits.max_batch_size == 0 {
            return Err(Error::InvalidConfig("edits.max_batch_size must be at least 1".into()));
        }
        if self.edits.brush_radius < 0.0 {
            return Err(Error::InvalidConfig("edits.brush_radius must be non-negative".into()));
        }
        if self.max_generation_jobs == 0 || self.max_loads_per_tick == 0 {
            return Err(Error::InvalidConfig("job limits must be at least 1".into()));
        }
        if self.worker_timeout_ms == 0 {
            return Err(Error::InvalidConfig("worker_timeout_ms must be positive".into()));
        }
        self.budget.validate()
    }

    /// Save to file (sync)
    pub fn save_sync(&self, path: &Path) -> std::result::Result<(), io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)
    }

    /// Load from file (sync)
    pub fn load_sync(path: &Path) -> std::result::Result<Self, io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Extraction budget policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Chunks extracted in the first tick.
    pub initial: usize,
    /// Lower bound, at least 1.
    pub min: usize,
    /// Upper bound.
    pub max: usize,
    /// Frame time the budget adapts toward (ms).
    pub target_frame_ms: f32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            initial: 4,
            min: 1,
            max: 16,
            target_frame_ms: 16.6,
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min == 0 {
            return Err(Error::InvalidConfig("budget.min must be at least 1".into()));
        }
        if self.max < self.min {
            return Err(Error::InvalidConfig(format!(
                "budget.max ({}) below budget.min ({})",
                self.max, self.min
            )));
        }
        if !(self.target_frame_ms > 0.0) {
            return Err(Error::InvalidConfig("budget.target_frame_ms must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        StreamingConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = StreamingConfig::default();
        config.unload_radius = config.load_radius;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = StreamingConfig::default();
        config.budget.min = 0;
        assert!(config.validate().is_err());

        let mut config = StreamingConfig::default();
        config.grid.voxel_size = 0.0;
        assert!(config.validate().is_err());

        let mut config = StreamingConfig::default();
        config.grid.resolution = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: StreamingConfig =
            serde_json::from_str(r#"{ "load_radius": 2, "budget": { "max": 3 } }"#).unwrap();
        assert_eq!(config.load_radius, 2);
        assert_eq!(config.budget.max, 3);
        assert_eq!(config.budget.min, 1);
        assert_eq!(config.grid, GridSpec::default());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("streaming.json");
        let mut config = StreamingConfig::default();
        config.terrain.seed = 77;
        config.edits.brush_radius = 3.5;
        config.save_sync(&path).unwrap();
        assert_eq!(StreamingConfig::load_sync(&path).unwrap(), config);
    }
}

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use isoterra::streaming::{PersistenceStore, StreamingConfig, TickReport, World};
use isoterra::terrain::{DensitySource, PlaneField};
use isoterra::voxel::density::GridSpec;

pub const SETTLE: Duration = Duration::from_secs(20);

/// Small chunks, no autosave, immediate edit flushing.
pub fn test_config() -> StreamingConfig {
    let mut config = StreamingConfig::default();
    config.grid = GridSpec {
        resolution: 8,
        voxel_size: 1.0,
        surface_level: 0.0,
    };
    config.worker_threads = 2;
    config.autosave_interval_ms = 0;
    config.edits.accumulation_window_ms = 0;
    config.edits.brush_radius = 1.5;
    config.edits.default_delta = 0.5;
    config
}

pub fn open_with(dir: &Path, config: StreamingConfig, source: Arc<dyn DensitySource>) -> World {
    isoterra::core::logging::init_for_tests();
    let store = PersistenceStore::open(dir, config.grid).unwrap();
    World::with_source(config, store, source).unwrap()
}

/// World over flat ground at y = 4.5
pub fn open_world(dir: &Path) -> World {
    open_with(dir, test_config(), Arc::new(PlaneField::new(4.5)))
}

pub fn settle(world: &mut World) -> TickReport {
    world.wait_for_background(SETTLE).unwrap()
}

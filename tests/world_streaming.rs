mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use isoterra::core::types::Vec3;
use isoterra::streaming::{ChunkEvent, ExtractionBudget};
use isoterra::terrain::{DensitySource, PlaneField};
use isoterra::voxel::boundary::BoundarySynchronizer;
use isoterra::voxel::chunk::{ChunkCoord, ChunkStatus};
use isoterra::voxel::edit::{Batch, EditRecord};

use common::{open_with, open_world, settle, test_config};

fn load_all(world: &mut isoterra::World, coords: &[ChunkCoord]) {
    for &c in coords {
        world.request_chunk(c);
    }
    settle(world);
    for &c in coords {
        assert!(world.is_chunk_loaded(c), "{c:?} not loaded");
    }
    world.drain_events();
}

#[test]
fn test_three_edits_one_batch_two_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let mut world = open_world(dir.path());
    let a = ChunkCoord::new(0, 0, 0);
    let b = ChunkCoord::new(1, 0, 0);
    load_all(&mut world, &[a, b]);
    world.set_extraction_budget(ExtractionBudget::fixed(2));

    for x in [7.5, 8.0, 8.5] {
        world.submit_edit(EditRecord::remove(Vec3::new(x, 4.0, 4.0)));
    }
    let report = world.tick();

    assert_eq!(report.batches_applied, 1);
    assert_eq!(report.batches_extracted, 1);
    assert_eq!(report.extracted, 2);
    assert_eq!(report.deferred, 0);
    assert_eq!(world.mesh_queue_len(), 0);

    let ga = &world.chunk(a).unwrap().buffers().unwrap().grid;
    let gb = &world.chunk(b).unwrap().buffers().unwrap().grid;
    assert_eq!(BoundarySynchronizer::new().face_mismatch(a, ga, b, gb), 0);
    assert_eq!(world.status(a), Some(ChunkStatus::Modified));
    assert_eq!(world.status(b), Some(ChunkStatus::Modified));

    let events = world.drain_events();
    for c in [a, b] {
        assert!(events.contains(&ChunkEvent::DataChanged(c)));
        assert!(events.contains(&ChunkEvent::MeshUpdated(c)));
    }
    // Nothing outside the batch was touched
    assert_eq!(world.chunk_count(), 2);
}

#[test]
fn test_budget_defers_large_batch_then_splits_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut world = open_world(dir.path());
    let line: Vec<ChunkCoord> = (0..6).map(|x| ChunkCoord::new(x, 0, 0)).collect();
    let pair: Vec<ChunkCoord> = (0..2).map(|x| ChunkCoord::new(x, 0, 10)).collect();
    let all: Vec<ChunkCoord> = line.iter().chain(&pair).copied().collect();
    load_all(&mut world, &all);
    world.set_extraction_budget(ExtractionBudget::fixed(3));

    // One interior edit per chunk
    for c in &all {
        let center = Vec3::new(c.x as f32 * 8.0 + 4.0, 4.0, c.z as f32 * 8.0 + 4.0);
        world.submit_edit(EditRecord::remove(center));
    }

    // Batches of 6 and 2 with budget 3: the pair runs, the line waits whole
    let first = world.tick();
    assert_eq!(first.extracted, 2);
    assert_eq!(first.deferred, 6);
    for c in &pair {
        assert_eq!(world.status(*c), Some(ChunkStatus::Modified));
    }
    for c in &line {
        assert_eq!(world.status(*c), Some(ChunkStatus::QueuedForMesh));
    }

    // The line alone: split into a connected prefix and one carried remainder
    let second = world.tick();
    assert_eq!(second.extracted, 3);
    assert_eq!(world.carried_batches(), &[line[3..].to_vec()]);
    for c in &line[..3] {
        assert!(world.mesh(*c).is_some());
    }
    assert!(!world.try_evict(line[4]));

    let third = world.tick();
    assert_eq!(third.extracted, 3);
    assert!(world.carried_batches().is_empty());
    assert_eq!(world.mesh_queue_len(), 0);
}

#[test]
fn test_edit_on_unloaded_chunk_loads_and_replays() {
    let dir = tempfile::tempdir().unwrap();
    let mut world = open_world(dir.path());
    let coord = ChunkCoord::new(0, 0, 0);
    assert!(!world.is_chunk_loaded(coord));

    world.submit_edit(EditRecord::remove(Vec3::new(4.0, 4.0, 4.0)));
    world.tick();
    assert_eq!(world.status(coord), Some(ChunkStatus::Queued));

    settle(&mut world);
    assert_eq!(world.status(coord), Some(ChunkStatus::Modified));
    // PlaneField gives 0.5 at y = 4; the brush center removes the full delta
    assert_eq!(world.density_at(Vec3::new(4.0, 4.0, 4.0)), Some(0.0));
}

#[test]
fn test_batch_sender_from_another_thread() {
    let dir = tempfile::tempdir().unwrap();
    let mut world = open_world(dir.path());
    let coord = ChunkCoord::new(0, 0, 0);
    load_all(&mut world, &[coord]);

    let sender = world.batch_sender();
    let spec = *world.spec();
    let brush = world.config().edits.brush();
    std::thread::spawn(move || {
        let batch = Batch::from_edits(&[EditRecord::add(Vec3::new(4.0, 5.0, 4.0))], &spec, &brush);
        assert!(sender.send(batch));
    })
    .join()
    .unwrap();

    let report = world.tick();
    assert_eq!(report.batches_applied, 1);
    assert!(report.samples_edited > 0);
    assert_eq!(world.density_at(Vec3::new(4.0, 5.0, 4.0)), Some(0.0));
}

#[test]
fn test_observer_streaming_and_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.load_radius = 1;
    config.vertical_radius = 0;
    config.unload_radius = 2;
    let mut world = open_with(dir.path(), config, Arc::new(PlaneField::new(4.5)));

    world.set_observers(&[Vec3::new(4.0, 4.0, 4.0)]);
    let report = settle(&mut world);
    assert_eq!(report.loaded + report.generated, 9);
    assert_eq!(world.loaded_coords().len(), 9);
    assert!(world.is_chunk_loaded(ChunkCoord::new(-1, 0, 1)));

    world.set_observers(&[Vec3::new(404.0, 4.0, 4.0)]);
    let report = settle(&mut world);
    assert_eq!(report.evicted, 9);
    let coords = world.loaded_coords();
    assert_eq!(coords.len(), 9);
    assert!(coords.iter().all(|c| (49..=51).contains(&c.x)));
    assert!(world.drain_events().contains(&ChunkEvent::Unloaded(ChunkCoord::new(0, 0, 0))));
}

#[test]
fn test_pinned_chunk_survives_observer_move() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.load_radius = 0;
    config.vertical_radius = 0;
    config.unload_radius = 1;
    let mut world = open_with(dir.path(), config, Arc::new(PlaneField::new(4.5)));

    let pinned = ChunkCoord::new(20, 0, 0);
    world.request_chunk(pinned);
    world.set_observers(&[Vec3::new(4.0, 4.0, 4.0)]);
    settle(&mut world);
    assert!(world.is_chunk_loaded(pinned));

    world.release_chunk(pinned);
    settle(&mut world);
    assert!(!world.is_chunk_loaded(pinned));
}

struct AlwaysPanics;

impl DensitySource for AlwaysPanics {
    fn density(&self, _pos: Vec3) -> f32 {
        panic!("broken density source")
    }
}

struct PanicsOnce {
    tripped: AtomicBool,
}

impl DensitySource for PanicsOnce {
    fn density(&self, pos: Vec3) -> f32 {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("transient fault");
        }
        PlaneField::new(4.5).density(pos)
    }
}

#[test]
fn test_worker_panic_retries_once_then_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut world = open_with(dir.path(), test_config(), Arc::new(AlwaysPanics));
    let coord = ChunkCoord::new(0, 0, 0);
    world.request_chunk(coord);
    let report = settle(&mut world);

    assert_eq!(report.failed, 1);
    assert_eq!(world.status(coord), Some(ChunkStatus::Failed));
    assert_eq!(world.chunk(coord).unwrap().retries, 1);
    let failures: Vec<_> = world
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, ChunkEvent::Failed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);

    // A terminally failed chunk can be evicted
    assert!(world.try_evict(coord));
}

#[test]
fn test_transient_worker_fault_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(PanicsOnce {
        tripped: AtomicBool::new(false),
    });
    let mut world = open_with(dir.path(), test_config(), source);
    let coord = ChunkCoord::new(0, 0, 0);
    world.request_chunk(coord);
    let report = settle(&mut world);

    assert_eq!(report.failed, 0);
    assert_eq!(report.generated, 1);
    assert_eq!(world.status(coord), Some(ChunkStatus::Loaded));
    assert!(world.mesh(coord).is_some());
    assert!(!world
        .drain_events()
        .iter()
        .any(|e| matches!(e, ChunkEvent::Failed { .. })));
}

#[test]
fn test_extraction_is_deterministic_across_worlds() {
    let coords = [ChunkCoord::new(0, 0, 0), ChunkCoord::new(0, 0, 1)];
    let mut meshes = Vec::new();
    for _ in 0..2 {
        let dir = tempfile::tempdir().unwrap();
        let mut world = open_world(dir.path());
        load_all(&mut world, &coords);
        world.submit_edit(EditRecord::remove(Vec3::new(4.0, 4.0, 8.0)));
        settle(&mut world);
        meshes.push(coords.map(|c| world.mesh(c).unwrap()));
    }
    assert_eq!(*meshes[0][0], *meshes[1][0]);
    assert_eq!(*meshes[0][1], *meshes[1][1]);
}

use criterion::{criterion_group, criterion_main, Criterion, black_box};

use isoterra::streaming::disk_io::{decode_record, encode_record};
use isoterra::streaming::plan_extraction;
use isoterra::terrain::{TerrainGenerator, TerrainParams};
use isoterra::voxel::boundary::BoundarySynchronizer;
use isoterra::voxel::chunk::{ChunkBuffers, ChunkCoord, ChunkSnapshot};
use isoterra::voxel::density::{DensityGrid, GridSpec};
use isoterra::voxel::mesh::extract;

fn spec(resolution: u32) -> GridSpec {
    GridSpec {
        resolution,
        voxel_size: 1.0,
        surface_level: 0.0,
    }
}

fn terrain_chunk(resolution: u32) -> ChunkBuffers {
    let generator = TerrainGenerator::new(TerrainParams {
        base_height: 8.0,
        height_scale: 16.0,
        ..Default::default()
    });
    ChunkBuffers::generate(ChunkCoord::new(0, 0, 0), &spec(resolution), &generator)
}

fn bench_generate_32(c: &mut Criterion) {
    let generator = TerrainGenerator::new(TerrainParams::default());
    let spec = spec(32);

    c.bench_function("generate_32", |b| {
        b.iter(|| DensityGrid::generate(black_box(ChunkCoord::new(0, 0, 0)), &spec, &generator));
    });
}

fn bench_extract_16(c: &mut Criterion) {
    let buffers = terrain_chunk(16);

    c.bench_function("extract_16", |b| {
        b.iter(|| extract(black_box(&buffers.grid), 1.0));
    });
}

fn bench_extract_32(c: &mut Criterion) {
    let buffers = terrain_chunk(32);

    c.bench_function("extract_32", |b| {
        b.iter(|| extract(black_box(&buffers.grid), 1.0));
    });
}

fn bench_synchronize_pair(c: &mut Criterion) {
    let s = spec(32);
    let sync = BoundarySynchronizer::new();

    c.bench_function("synchronize_pair_32", |b| {
        b.iter(|| {
            let mut a = DensityGrid::filled(&s, 0.4);
            let mut other = DensityGrid::filled(&s, -0.4);
            sync.synchronize(&mut [
                (ChunkCoord::new(0, 0, 0), &mut a),
                (ChunkCoord::new(1, 0, 0), &mut other),
            ])
        });
    });
}

fn bench_plan_extraction(c: &mut Criterion) {
    // A slab of 256 queued chunks plus scattered singles
    let mut queued = Vec::new();
    for x in 0..16 {
        for z in 0..16 {
            queued.push(ChunkCoord::new(x, 0, z));
        }
    }
    for i in 0..64 {
        queued.push(ChunkCoord::new(i * 3, 10, 40));
    }

    c.bench_function("plan_extraction_320", |b| {
        b.iter(|| plan_extraction(black_box(&queued), &[], black_box(16)));
    });
}

fn bench_record_round_trip(c: &mut Criterion) {
    let snapshot = ChunkSnapshot {
        coord: ChunkCoord::new(0, 0, 0),
        buffers: terrain_chunk(32),
        applied_sequence: 1,
        revision: 1,
    };
    let s = spec(32);

    c.bench_function("record_encode_decode_32", |b| {
        b.iter(|| {
            let bytes = encode_record(black_box(&snapshot)).unwrap();
            decode_record(&bytes, snapshot.coord, &s).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_generate_32,
    bench_extract_16,
    bench_extract_32,
    bench_synchronize_pair,
    bench_plan_extraction,
    bench_record_round_trip,
);
criterion_main!(benches);

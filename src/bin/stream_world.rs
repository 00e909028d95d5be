//! Headless world driver: streams chunks around a moving observer, mines a
//! trench along its path and saves the result.
//!
//! Usage: cargo run --release --bin stream_world -- [OPTIONS]
//!
//! Options:
//!   --root <DIR>      Directory holding worlds (default: "worlds")
//!   --name <NAME>     World to load or create (default: "demo")
//!   --seed <SEED>     Seed for a new world (default: 12345)
//!   --ticks <N>       Ticks to run (default: 240)
//!   --radius <N>      Load radius in chunks (default: 3)
//!   --speed <M>       Observer speed in meters per tick (default: 0.5)
//!   --edit-every <N>  Submit one mining edit every N ticks, 0 = never (default: 4)
//!   --compact         Compact the edit log after saving
//!   --list            List worlds under --root and exit

use std::path::PathBuf;
use std::time::{Duration, Instant};

use isoterra::core::types::Vec3;
use isoterra::streaming::{PersistenceStore, StreamingConfig, TickReport, World};
use isoterra::terrain::TerrainGenerator;
use isoterra::{ChunkEvent, EditRecord};

fn main() {
    isoterra::core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = run(&args) {
        log::error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> isoterra::Result<()> {
    let root = PathBuf::from(parse_str_arg(args, "--root").unwrap_or_else(|| "worlds".to_string()));
    let name = parse_str_arg(args, "--name").unwrap_or_else(|| "demo".to_string());
    let seed = parse_u32_arg(args, "--seed").unwrap_or(12345);
    let ticks = parse_usize_arg(args, "--ticks").unwrap_or(240);
    let radius = parse_usize_arg(args, "--radius").unwrap_or(3) as i32;
    let speed = parse_f32_arg(args, "--speed").unwrap_or(0.5);
    let edit_every = parse_usize_arg(args, "--edit-every").unwrap_or(4);
    let compact = args.iter().any(|a| a == "--compact");

    if args.iter().any(|a| a == "--list") {
        let worlds = PersistenceStore::list_worlds(&root)?;
        println!("{} worlds under {}", worlds.len(), root.display());
        for w in worlds {
            println!("  {:<20} seed {:<10} created {}", w.name, w.config.terrain.seed, w.created_at);
        }
        return Ok(());
    }

    let store = match PersistenceStore::load_world(&root, &name) {
        Ok(store) => store,
        Err(isoterra::Error::WorldNotFound(_)) => {
            let mut config = StreamingConfig::default();
            config.terrain.seed = seed;
            config.load_radius = radius;
            config.unload_radius = radius + 2;
            PersistenceStore::create_world(&root, &name, config)?
        }
        Err(e) => return Err(e),
    };
    let mut world = World::open(store)?;
    let terrain = TerrainGenerator::new(world.config().terrain.clone());

    println!("=== Isoterra Stream ===");
    println!("World:  {}", name);
    println!("Seed:   {}", world.config().terrain.seed);
    println!("Ticks:  {}", ticks);
    println!("Radius: {} chunks", world.config().load_radius);
    println!();

    let start = Instant::now();
    let mut total = TickReport::default();
    let mut failures = 0;
    let mut x = 0.0f32;
    let z = 0.0f32;

    for tick in 0..ticks {
        let frame_start = Instant::now();
        let ground = terrain.height_at(x, z);
        world.set_observers(&[Vec3::new(x, ground + 2.0, z)]);

        if edit_every > 0 && tick % edit_every == 0 {
            world.submit_edit(EditRecord::remove(Vec3::new(x, ground, z)));
        }

        let report = world.tick();
        total.merge(&report);
        for event in world.drain_events() {
            if let ChunkEvent::Failed { coord, reason } = event {
                failures += 1;
                eprintln!("  chunk {:?} failed: {}", coord, reason);
            }
        }
        world.record_frame(frame_start.elapsed());

        if tick % 60 == 0 {
            println!(
                "  [tick {:>4}] resident {:>4}, mesh queue {:>3}, budget {:>2}",
                tick,
                world.chunk_count(),
                world.mesh_queue_len(),
                report.budget
            );
        }
        x += speed;
    }

    let settled = world.wait_for_background(Duration::from_secs(30))?;
    total.merge(&settled);
    let saved = world.save_all()?;
    if compact {
        let removed = world.compact_edit_log()?;
        println!("Edit log: {} entries compacted", removed);
    }

    println!();
    println!("=== Summary ===");
    println!("Elapsed:         {:.2}s", start.elapsed().as_secs_f64());
    println!("Loaded:          {}", total.loaded);
    println!("Generated:       {}", total.generated);
    println!("Extracted:       {} ({} batches)", total.extracted, total.batches_extracted);
    println!("Samples edited:  {}", total.samples_edited);
    println!("Evicted:         {}", total.evicted);
    let triangles: usize = world
        .loaded_coords()
        .into_iter()
        .filter_map(|c| world.mesh(c))
        .map(|m| m.triangle_count())
        .sum();
    println!("Triangles:       {} in {} resident chunks", triangles, world.chunk_count());
    println!("Saved:           {}", total.saved + saved);
    println!("Failed:          {}", failures);

    world.shutdown()
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

//! Procedural terrain generation

pub mod generator;
pub use generator::{TerrainGenerator, TerrainParams};

pub mod source;
pub use source::{DensitySource, PlaneField};

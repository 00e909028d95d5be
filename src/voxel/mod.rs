//! Voxel data structures and operations

pub mod boundary;
pub mod chunk;
pub mod density;
pub mod edit;
pub mod mesh;

pub use boundary::{average, BoundarySynchronizer, SyncReport};
pub use chunk::{BufferSlot, Chunk, ChunkBuffers, ChunkCoord, ChunkSnapshot, ChunkStatus};
pub use density::{DensityGrid, GridSpec, MAX_DENSITY, MIN_DENSITY};
pub use mesh::{extract, ChunkMesh, IsosurfaceExtractor, MeshVertex};

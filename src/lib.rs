//! Isoterra - streamed, editable isosurface voxel terrain

pub mod core;
pub mod math;
pub mod streaming;
pub mod terrain;
pub mod voxel;

pub use crate::core::error::Error;
pub use crate::core::types::Result;
pub use crate::streaming::{ChunkEvent, PersistenceStore, StreamingConfig, TickReport, World};
pub use crate::voxel::chunk::{ChunkCoord, ChunkStatus};
pub use crate::voxel::edit::{EditKind, EditRecord};

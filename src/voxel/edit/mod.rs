//! Voxel editing: edit records, batching and the persistent edit log.

pub mod batcher;
pub mod delta;
pub mod log;

pub use batcher::{Batch, BatchSender, BatcherState, EditBatchConfig, EditBatcher};
pub use delta::{Brush, EditKind, EditRecord, SampleEdit};
pub use log::{EditLog, ModificationLogEntry};

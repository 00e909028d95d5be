//! Chunk streaming, scheduling and persistence

pub mod budget;
pub mod catalog;
pub mod config;
pub mod disk_io;
pub mod planner;
pub mod priority;
pub mod scheduler;
pub mod store;
pub mod workers;

pub use budget::ExtractionBudget;
pub use catalog::WorldManifest;
pub use config::{BudgetConfig, StreamingConfig};
pub use disk_io::{chunk_path, decode_record, encode_record, DecodedRecord};
pub use planner::{plan_extraction, ExtractionPlan, PlannedBatch};
pub use priority::{ChunkPriority, ChunkPriorityQueue, LoadRange};
pub use scheduler::{ChunkEvent, TickReport, World};
pub use store::{PersistenceStore, StoreResult};
pub use workers::{JobKind, JobOutput, JobTicket, WorkerPool};

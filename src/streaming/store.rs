//! Async persistence of chunk records and the edit log
//!
//! The store owns a dedicated tokio runtime. Record reads and writes run as
//! spawned tasks that report back over a channel drained by the scheduler;
//! edit-log appends are serialized through a single writer task. The store
//! only ever receives [`ChunkSnapshot`] copies, never live chunk buffers.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, oneshot};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::streaming::catalog::WorldManifest;
use crate::streaming::disk_io::{decode_record, read_record, save_record, DecodedRecord};
use crate::voxel::chunk::{ChunkCoord, ChunkSnapshot};
use crate::voxel::density::GridSpec;
use crate::voxel::edit::log::EditLog;
use crate::voxel::edit::ModificationLogEntry;

pub const CHUNK_DIR: &str = "chunks";
pub const EDIT_LOG_FILE: &str = "edits.log";

/// Completion of a store operation
#[derive(Debug)]
pub enum StoreResult {
    /// A valid record was found
    Loaded { coord: ChunkCoord, record: DecodedRecord },
    /// No record on disk
    NotFound(ChunkCoord),
    /// A record exists but cannot be decoded
    Corrupt { coord: ChunkCoord, reason: String },
    /// The lookup itself failed
    LoadFailed { coord: ChunkCoord, error: String },
    /// Snapshot of `revision` is durable
    Saved {
        coord: ChunkCoord,
        revision: u64,
        applied_sequence: u64,
    },
    SaveFailed {
        coord: ChunkCoord,
        revision: u64,
        error: String,
    },
}

impl StoreResult {
    pub fn coord(&self) -> ChunkCoord {
        match self {
            StoreResult::Loaded { coord, .. }
            | StoreResult::Corrupt { coord, .. }
            | StoreResult::LoadFailed { coord, .. }
            | StoreResult::Saved { coord, .. }
            | StoreResult::SaveFailed { coord, .. } => *coord,
            StoreResult::NotFound(coord) => *coord,
        }
    }
}

enum LogCommand {
    Append(Vec<u8>),
    Sync(oneshot::Sender<std::io::Result<()>>),
    /// Replace the whole file (compaction)
    Rewrite {
        bytes: Vec<u8>,
        done: oneshot::Sender<std::io::Result<()>>,
    },
}

/// Chunk records plus edit log of one world directory
pub struct PersistenceStore {
    root: PathBuf,
    chunk_dir: PathBuf,
    spec: GridSpec,
    manifest: Option<WorldManifest>,
    runtime: Runtime,
    result_tx: mpsc::UnboundedSender<StoreResult>,
    result_rx: mpsc::UnboundedReceiver<StoreResult>,
    log_tx: mpsc::UnboundedSender<LogCommand>,
    edit_log: EditLog,
    pending_loads: HashSet<ChunkCoord>,
    pending_saves: HashSet<ChunkCoord>,
    in_flight: Arc<AtomicUsize>,
    /// Applied sequence of the newest durable record per chunk
    baked: HashMap<ChunkCoord, u64>,
}

impl PersistenceStore {
    /// Open (or create) a store rooted at `root` without a manifest.
    pub fn open(root: impl AsRef<Path>, spec: GridSpec) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let chunk_dir = root.join(CHUNK_DIR);
        std::fs::create_dir_all(&chunk_dir)?;

        let edit_log = EditLog::open(root.join(EDIT_LOG_FILE), spec.resolution)?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("isoterra-io")
            .enable_all()
            .build()?;

        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        runtime.spawn(log_writer(edit_log.path().to_path_buf(), log_rx));

        log::info!("Opened store at {:?}", root);
        Ok(Self {
            root,
            chunk_dir,
            spec,
            manifest: None,
            runtime,
            result_tx,
            result_rx,
            log_tx,
            edit_log,
            pending_loads: HashSet::new(),
            pending_saves: HashSet::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            baked: HashMap::new(),
        })
    }

    pub(crate) fn with_manifest(mut self, manifest: WorldManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_dir(&self) -> &Path {
        &self.chunk_dir
    }

    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    pub fn manifest(&self) -> Option<&WorldManifest> {
        self.manifest.as_ref()
    }

    pub fn edit_log(&self) -> &EditLog {
        &self.edit_log
    }

    pub fn is_loading(&self, coord: ChunkCoord) -> bool {
        self.pending_loads.contains(&coord)
    }

    pub fn is_saving(&self, coord: ChunkCoord) -> bool {
        self.pending_saves.contains(&coord)
    }

    /// Loads and saves not yet reported back
    pub fn pending_count(&self) -> usize {
        self.pending_loads.len() + self.pending_saves.len()
    }

    /// Start a disk lookup for `coord`. Returns `false` if one is already pending.
    pub fn request_load(&mut self, coord: ChunkCoord) -> bool {
        if !self.pending_loads.insert(coord) {
            return false;
        }
        let dir = self.chunk_dir.clone();
        let spec = self.spec;
        let tx = self.result_tx.clone();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::SeqCst);

        self.runtime.spawn(async move {
            let result = match read_record(&dir, coord).await {
                Ok(None) => StoreResult::NotFound(coord),
                Ok(Some(bytes)) => match decode_record(&bytes, coord, &spec) {
                    Ok(record) => StoreResult::Loaded { coord, record },
                    Err(e) => StoreResult::Corrupt {
                        coord,
                        reason: e.to_string(),
                    },
                },
                Err(e) => StoreResult::LoadFailed {
                    coord,
                    error: e.to_string(),
                },
            };
            let _ = tx.send(result);
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        true
    }

    /// Write a snapshot in the background. Returns `false` if a save of the
    /// same chunk is still in flight.
    pub fn save_snapshot(&mut self, snapshot: ChunkSnapshot) -> bool {
        let coord = snapshot.coord;
        if !self.pending_saves.insert(coord) {
            return false;
        }
        let dir = self.chunk_dir.clone();
        let tx = self.result_tx.clone();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::SeqCst);

        self.runtime.spawn(async move {
            let result = match save_record(&dir, &snapshot).await {
                Ok(()) => StoreResult::Saved {
                    coord,
                    revision: snapshot.revision,
                    applied_sequence: snapshot.applied_sequence,
                },
                Err(e) => StoreResult::SaveFailed {
                    coord,
                    revision: snapshot.revision,
                    error: e.to_string(),
                },
            };
            let _ = tx.send(result);
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        true
    }

    /// Reserve the next edit-log sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.edit_log.next_sequence()
    }

    /// Index `entries` and queue them for the log writer.
    pub fn log_edits(&mut self, entries: &[ModificationLogEntry]) {
        if entries.is_empty() {
            return;
        }
        let bytes = self.edit_log.record(entries);
        if self.log_tx.send(LogCommand::Append(bytes)).is_err() {
            log::warn!("Edit log writer is gone; {} entries not persisted", entries.len());
        }
    }

    /// Block until every queued log append is on disk.
    pub fn sync_log(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.log_tx
            .send(LogCommand::Sync(done))
            .map_err(|_| Error::Persistence("edit log writer stopped".into()))?;
        self.runtime
            .block_on(rx)
            .map_err(|_| Error::Persistence("edit log writer stopped".into()))??;
        Ok(())
    }

    /// Drop log entries already baked into durable records and rewrite the file.
    ///
    /// Returns the number of entries removed.
    pub fn compact_edit_log(&mut self) -> Result<usize> {
        let before = self.edit_log.entry_count();
        let bytes = self.edit_log.compact(&self.baked);
        let removed = before - self.edit_log.entry_count();

        let (done, rx) = oneshot::channel();
        self.log_tx
            .send(LogCommand::Rewrite { bytes, done })
            .map_err(|_| Error::Persistence("edit log writer stopped".into()))?;
        self.runtime
            .block_on(rx)
            .map_err(|_| Error::Persistence("edit log writer stopped".into()))??;

        log::info!(
            "Compacted edit log: removed {} entries, {} remain",
            removed,
            self.edit_log.entry_count()
        );
        Ok(removed)
    }

    /// Drain completed operations (non-blocking).
    pub fn poll_results(&mut self) -> Vec<StoreResult> {
        let mut results = Vec::new();
        while let Ok(result) = self.result_rx.try_recv() {
            match &result {
                StoreResult::Saved {
                    coord,
                    applied_sequence,
                    ..
                } => {
                    self.pending_saves.remove(coord);
                    let baked = self.baked.entry(*coord).or_insert(0);
                    *baked = (*baked).max(*applied_sequence);
                }
                StoreResult::SaveFailed { coord, .. } => {
                    self.pending_saves.remove(coord);
                }
                other => {
                    self.pending_loads.remove(&other.coord());
                }
            }
            results.push(result);
        }
        results
    }

    /// Block until no load or save task is running and the log is synced.
    pub fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let in_flight = self.in_flight.clone();
        let drained = self.runtime.block_on(async move {
            tokio::time::timeout(timeout, async {
                while in_flight.load(Ordering::SeqCst) > 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
        });
        if drained.is_err() {
            return Err(Error::Persistence(format!(
                "store still busy after {:?}",
                timeout
            )));
        }
        self.sync_log()
    }

    /// Finish outstanding work and stop the runtime.
    pub fn close(self, timeout: Duration) -> Result<()> {
        let result = self.wait_idle(timeout);
        drop(self.log_tx);
        self.runtime.shutdown_timeout(timeout);
        log::info!("Closed store at {:?}", self.root);
        result
    }
}

/// Single writer for the edit log; commands are applied in send order.
async fn log_writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<LogCommand>) {
    let mut file = match open_append(&path).await {
        Ok(f) => f,
        Err(e) => {
            log::error!("Edit log {:?}: cannot open for append: {}", path, e);
            return;
        }
    };

    while let Some(command) = rx.recv().await {
        match command {
            LogCommand::Append(bytes) => {
                if let Err(e) = file.write_all(&bytes).await {
                    log::warn!("Edit log {:?}: append failed: {}", path, e);
                }
            }
            LogCommand::Sync(done) => {
                let result = match file.flush().await {
                    Ok(()) => file.sync_data().await,
                    Err(e) => Err(e),
                };
                let _ = done.send(result);
            }
            LogCommand::Rewrite { bytes, done } => {
                let result = rewrite(&path, &bytes).await;
                match open_append(&path).await {
                    Ok(f) => file = f,
                    Err(e) => log::error!("Edit log {:?}: reopen failed: {}", path, e),
                }
                let _ = done.send(result);
            }
        }
    }
    let _ = file.flush().await;
    let _ = file.sync_data().await;
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new().append(true).open(path).await
}

async fn rewrite(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

//! Bounded worker pool for density generation and isosurface extraction
//!
//! A job takes ownership of one chunk's buffers and hands them back through
//! its [`JobTicket`]. Panics are caught on the worker and reported as
//! [`Error::WorkerPanic`]; a ticket not completed within the pool timeout
//! yields [`Error::WorkerTimeout`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::terrain::DensitySource;
use crate::voxel::chunk::{ChunkBuffers, ChunkCoord};
use crate::voxel::density::GridSpec;
use crate::voxel::mesh::{extract, ChunkMesh};

/// What a job computes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    Generate,
    Extract,
}

impl JobKind {
    pub fn name(self) -> &'static str {
        match self {
            JobKind::Generate => "generation",
            JobKind::Extract => "extraction",
        }
    }
}

/// Result of a completed job. Buffers always come back.
#[derive(Debug)]
pub enum JobOutput {
    Generated(ChunkBuffers),
    Extracted { buffers: ChunkBuffers, mesh: ChunkMesh },
}

type JobResult = std::result::Result<JobOutput, String>;

/// Completion handle for one dispatched job
pub struct JobTicket {
    pub id: u64,
    pub coord: ChunkCoord,
    pub kind: JobKind,
    started: Instant,
    timeout: Duration,
    rx: Receiver<JobResult>,
}

impl JobTicket {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_overdue(&self) -> bool {
        self.started.elapsed() > self.timeout
    }

    /// Non-blocking check. `None` while the job is still running and within
    /// its timeout.
    pub fn try_complete(&self) -> Option<Result<JobOutput>> {
        match self.rx.try_recv() {
            Ok(result) => Some(self.convert(result)),
            Err(TryRecvError::Empty) if self.is_overdue() => Some(Err(self.timed_out())),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(self.dropped())),
        }
    }

    /// Block until the job finishes or its timeout expires.
    pub fn join(self) -> Result<JobOutput> {
        let remaining = self.timeout.saturating_sub(self.started.elapsed());
        match self.rx.recv_timeout(remaining) {
            Ok(result) => self.convert(result),
            Err(RecvTimeoutError::Timeout) => Err(self.timed_out()),
            Err(RecvTimeoutError::Disconnected) => Err(self.dropped()),
        }
    }

    fn convert(&self, result: JobResult) -> Result<JobOutput> {
        result.map_err(|message| Error::WorkerPanic {
            coord: self.coord,
            kind: self.kind.name(),
            message,
        })
    }

    fn timed_out(&self) -> Error {
        Error::WorkerTimeout {
            coord: self.coord,
            kind: self.kind.name(),
            elapsed: self.started.elapsed(),
        }
    }

    fn dropped(&self) -> Error {
        Error::WorkerPanic {
            coord: self.coord,
            kind: self.kind.name(),
            message: "worker dropped its result".into(),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fixed-size rayon pool shared by generation and extraction
pub struct WorkerPool {
    pool: ThreadPool,
    timeout: Duration,
    next_ticket: u64,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// `threads == 0` uses one thread per CPU.
    pub fn new(threads: usize, timeout: Duration) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("isoterra-worker-{i}"))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("worker pool: {e}")))?;
        log::debug!("Worker pool started with {} threads", pool.current_num_threads());
        Ok(Self {
            pool,
            timeout,
            next_ticket: 1,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Jobs dispatched and not yet finished on a worker
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Reserve a ticket id, used to mark a chunk's slot as lent before dispatch.
    pub fn reserve_ticket(&mut self) -> u64 {
        let id = self.next_ticket;
        self.next_ticket += 1;
        id
    }

    /// Sample fresh buffers for `coord` on a worker.
    pub fn dispatch_generate(
        &mut self,
        coord: ChunkCoord,
        spec: GridSpec,
        source: Arc<dyn DensitySource>,
    ) -> JobTicket {
        let id = self.reserve_ticket();
        self.spawn(id, coord, JobKind::Generate, move || {
            JobOutput::Generated(ChunkBuffers::generate(coord, &spec, source.as_ref()))
        })
    }

    /// Extract the isosurface of lent `buffers` on a worker.
    pub fn dispatch_extract(
        &mut self,
        ticket_id: u64,
        coord: ChunkCoord,
        buffers: ChunkBuffers,
        voxel_size: f32,
    ) -> JobTicket {
        self.spawn(ticket_id, coord, JobKind::Extract, move || {
            let mesh = extract(&buffers.grid, voxel_size);
            JobOutput::Extracted { buffers, mesh }
        })
    }

    fn spawn<F>(&mut self, id: u64, coord: ChunkCoord, kind: JobKind, job: F) -> JobTicket
    where
        F: FnOnce() -> JobOutput + Send + 'static,
    {
        let (tx, rx): (SyncSender<JobResult>, Receiver<JobResult>) = mpsc::sync_channel(1);
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::Relaxed);

        self.pool.spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(job)).map_err(panic_message);
            if let Err(message) = &result {
                log::error!("{} job for chunk {:?} panicked: {}", kind.name(), coord, message);
            }
            in_flight.fetch_sub(1, Ordering::Relaxed);
            // Receiver is gone when the scheduler already gave up on this job
            let _ = tx.send(result);
        });

        JobTicket {
            id,
            coord,
            kind,
            started: Instant::now(),
            timeout: self.timeout,
            rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;
    use crate::terrain::PlaneField;

    fn spec() -> GridSpec {
        GridSpec {
            resolution: 4,
            voxel_size: 1.0,
            surface_level: 0.0,
        }
    }

    struct Exploding;

    impl DensitySource for Exploding {
        fn density(&self, _pos: Vec3) -> f32 {
            panic!("density source exploded")
        }
    }

    struct Slow;

    impl DensitySource for Slow {
        fn density(&self, pos: Vec3) -> f32 {
            std::thread::sleep(Duration::from_millis(5));
            -pos.y
        }
    }

    #[test]
    fn test_generate_and_extract() {
        let mut pool = WorkerPool::new(2, Duration::from_secs(10)).unwrap();
        let coord = ChunkCoord::new(0, 0, 0);
        let ticket = pool.dispatch_generate(coord, spec(), Arc::new(PlaneField::new(2.5)));
        let buffers = match ticket.join().unwrap() {
            JobOutput::Generated(b) => b,
            other => panic!("unexpected output {other:?}"),
        };
        assert_eq!(buffers, ChunkBuffers::generate(coord, &spec(), &PlaneField::new(2.5)));

        let id = pool.reserve_ticket();
        let ticket = pool.dispatch_extract(id, coord, buffers.clone(), 1.0);
        assert_eq!(ticket.id, id);
        match ticket.join().unwrap() {
            JobOutput::Extracted { buffers: back, mesh } => {
                assert_eq!(back, buffers);
                assert!(!mesh.is_empty());
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_panic_is_reported() {
        let mut pool = WorkerPool::new(1, Duration::from_secs(10)).unwrap();
        let ticket = pool.dispatch_generate(ChunkCoord::new(1, 0, 0), spec(), Arc::new(Exploding));
        match ticket.join() {
            Err(Error::WorkerPanic { coord, message, .. }) => {
                assert_eq!(coord, ChunkCoord::new(1, 0, 0));
                assert!(message.contains("exploded"));
            }
            other => panic!("expected panic error, got {other:?}"),
        }
        // Pool survives the panic
        let ticket = pool.dispatch_generate(ChunkCoord::new(0, 0, 0), spec(), Arc::new(PlaneField::new(0.5)));
        assert!(ticket.join().is_ok());
    }

    #[test]
    fn test_timeout() {
        let mut pool = WorkerPool::new(1, Duration::from_millis(1)).unwrap();
        let ticket = pool.dispatch_generate(ChunkCoord::new(0, 0, 0), spec(), Arc::new(Slow));
        assert!(matches!(ticket.join(), Err(Error::WorkerTimeout { .. })));
    }

    #[test]
    fn test_try_complete_polls() {
        let mut pool = WorkerPool::new(1, Duration::from_secs(10)).unwrap();
        let ticket = pool.dispatch_generate(ChunkCoord::new(0, 0, 0), spec(), Arc::new(PlaneField::new(1.0)));
        let started = Instant::now();
        loop {
            if let Some(result) = ticket.try_complete() {
                assert!(result.is_ok());
                break;
            }
            assert!(started.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pool.in_flight(), 0);
    }
}

//! Concurrent tile fetching under a deadline.
//!
//! One task per tile source runs on a shared worker pool. The render thread
//! waits on a single result channel until every task has answered or the
//! deadline passes. Late answers are dropped on the floor: the channel's
//! receiver is gone by then and the send simply fails.
//!
//! A source has at most one task in flight. While a hung task from an
//! earlier frame is still running, the source is reported as timed out
//! instead of being handed another worker.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use terra_common::{FragmentId, SourceError, SourceId};

use crate::request::TileRequest;
use crate::source::{TileBatch, TileSource};
use crate::tile::TextureTile;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// How long dropping a pool waits for busy workers before detaching them.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Fixed set of worker threads executing fetch tasks.
///
/// Dropping the pool closes the job channel and joins the workers. Workers
/// still stuck in a source after [`SHUTDOWN_GRACE`] are detached; they exit
/// as soon as the source returns.
pub struct FetchPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl FetchPool {
    /// Spawns `workers` threads.
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let handles = (0..workers.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("terra-fetch-{i}"))
                    .spawn(move || worker_loop(&receiver))
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        debug!("Started fetch pool with {} workers", handles.len());
        Ok(Self {
            sender: Some(sender),
            workers: handles,
        })
    }

    /// Number of worker threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    fn execute(&self, job: Job) -> Result<(), SourceError> {
        self.sender
            .as_ref()
            .ok_or(SourceError::PoolClosed)?
            .send(job)
            .map_err(|_| SourceError::PoolClosed)
    }
}

impl Drop for FetchPool {
    fn drop(&mut self) {
        // workers leave their loop once the channel is closed and drained
        self.sender = None;

        let until = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < until && !self.workers.iter().all(JoinHandle::is_finished) {
            thread::sleep(Duration::from_millis(1));
        }

        let mut joined = 0;
        let mut detached = 0;
        for worker in self.workers.drain(..) {
            if worker.is_finished() {
                if worker.join().is_err() {
                    error!("Fetch worker panicked");
                }
                joined += 1;
            } else {
                detached += 1;
            }
        }
        debug!("Fetch pool stopped: {joined} workers joined, {detached} still busy and detached");
    }
}

impl std::fmt::Debug for FetchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchPool")
            .field("workers", &self.workers.len())
            .field("open", &self.sender.is_some())
            .finish()
    }
}

fn worker_loop(receiver: &Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Fetch job panicked outside its source");
        }
    }
}

/// Work for one source: the tile requests it should answer.
pub struct FetchJob {
    /// Source to query
    pub source: Arc<dyn TileSource>,
    /// Coalesced requests for this source
    pub requests: Vec<TileRequest>,
}

/// Aggregate result of one fetch barrier.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Answers per source that finished in time
    pub batches: BTreeMap<SourceId, TileBatch>,
    /// Sources that failed or missed the deadline
    pub errors: Vec<SourceError>,
    /// Time spent waiting
    pub elapsed: Duration,
}

impl FetchOutcome {
    /// Tile answered by `source` for `fragment`.
    #[must_use]
    pub fn tile(&self, source: SourceId, fragment: FragmentId) -> Option<&Arc<TextureTile>> {
        self.batches.get(&source)?.get(&fragment)
    }

    /// Number of sources that missed the deadline.
    #[must_use]
    pub fn timed_out(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| matches!(e, SourceError::Timeout { .. }))
            .count()
    }

    /// Number of sources that failed for any other reason.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.errors.len() - self.timed_out()
    }
}

/// Marks a source busy until the task holding it ends.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fans tile requests out to sources and joins under one deadline.
#[derive(Debug)]
pub struct ConcurrentFetcher {
    pool: FetchPool,
    default_timeout: Duration,
    max_deadline: Duration,
    /// Per-source flag, set while a task for that source runs or waits
    in_flight: Mutex<BTreeMap<SourceId, Arc<AtomicBool>>>,
}

impl ConcurrentFetcher {
    /// Creates a fetcher on top of `pool`.
    #[must_use]
    pub fn new(pool: FetchPool, default_timeout: Duration, max_deadline: Duration) -> Self {
        Self {
            pool,
            default_timeout,
            max_deadline,
            in_flight: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the worker pool.
    #[must_use]
    pub const fn pool(&self) -> &FetchPool {
        &self.pool
    }

    fn claim(&self, source: SourceId) -> Option<InFlight> {
        let flag = Arc::clone(self.in_flight.lock().entry(source).or_default());
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(InFlight(flag))
        }
    }

    /// Longest declared timeout among `sources`, capped by the configured
    /// maximum.
    #[must_use]
    pub fn deadline_for<'a>(&self, sources: impl IntoIterator<Item = &'a Arc<dyn TileSource>>) -> Duration {
        sources
            .into_iter()
            .map(|s| s.timeout().unwrap_or(self.default_timeout))
            .max()
            .unwrap_or(self.default_timeout)
            .min(self.max_deadline)
    }

    /// Gives every source the full request list.
    pub fn fetch_all(
        &self,
        requests: &[TileRequest],
        sources: &[Arc<dyn TileSource>],
    ) -> FetchOutcome {
        let deadline = self.deadline_for(sources);
        let jobs = sources
            .iter()
            .map(|source| FetchJob {
                source: Arc::clone(source),
                requests: requests.to_vec(),
            })
            .collect();
        self.fetch(jobs, deadline)
    }

    /// Runs all jobs in parallel and collects whatever completes within
    /// `deadline`. Never fails: broken or slow sources show up in
    /// [`FetchOutcome::errors`]. A source whose previous task is still
    /// running is not dispatched again and counts as timed out.
    pub fn fetch(&self, jobs: Vec<FetchJob>, deadline: Duration) -> FetchOutcome {
        let started = Instant::now();
        let until = started + deadline;
        let millis = deadline.as_millis() as u64;
        let mut outcome = FetchOutcome::default();

        let (tx, rx) = bounded::<(SourceId, Result<TileBatch, SourceError>)>(jobs.len().max(1));
        let mut outstanding: Vec<SourceId> = Vec::with_capacity(jobs.len());

        for job in jobs {
            if job.requests.is_empty() {
                continue;
            }
            let source_id = job.source.id();
            let Some(in_flight) = self.claim(source_id) else {
                warn!("{source_id}: previous fetch still running, skipping");
                outcome.errors.push(SourceError::Timeout { source_id, millis });
                continue;
            };
            let tx = tx.clone();
            let task = Box::new(move || {
                let _in_flight = in_flight;
                if Instant::now() >= until {
                    trace!("{source_id}: skipped, barrier already closed");
                    return;
                }
                let result = run_source(job.source.as_ref(), &job.requests, until, deadline);
                // receiver is gone once the barrier has timed out
                let _ = tx.send((source_id, result));
            });
            match self.pool.execute(task) {
                Ok(()) => outstanding.push(source_id),
                Err(e) => outcome.errors.push(e),
            }
        }
        drop(tx);

        while !outstanding.is_empty() {
            match rx.recv_deadline(until) {
                Ok((source_id, result)) => {
                    if let Some(pos) = outstanding.iter().position(|s| *s == source_id) {
                        outstanding.swap_remove(pos);
                    }
                    match result {
                        Ok(batch) => {
                            trace!("{source_id}: answered {} fragments", batch.len());
                            outcome.batches.insert(source_id, batch);
                        },
                        Err(e) => {
                            warn!("Tile fetch failed: {e}");
                            outcome.errors.push(e);
                        },
                    }
                },
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }

        for source_id in outstanding {
            warn!("{source_id}: no answer within {millis} ms, ignoring");
            outcome.errors.push(SourceError::Timeout { source_id, millis });
        }

        outcome.elapsed = started.elapsed();
        outcome
    }
}

fn run_source(
    source: &dyn TileSource,
    requests: &[TileRequest],
    until: Instant,
    deadline: Duration,
) -> Result<TileBatch, SourceError> {
    let source_id = source.id();
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut batch = TileBatch::new();
        for request in requests {
            if Instant::now() >= until {
                return Err(SourceError::Timeout {
                    source_id,
                    millis: deadline.as_millis() as u64,
                });
            }
            batch.extend(source.fetch(request)?);
        }
        Ok(batch)
    }));
    result.unwrap_or_else(|payload| {
        Err(SourceError::Panicked {
            source_id,
            message: panic_message(payload.as_ref()),
        })
    })
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic".to_string())
}

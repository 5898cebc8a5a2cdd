//! Timer-driven scheduling of sync jobs.
//!
//! All jobs share one tokio task that sleeps until the earliest due time
//! in a min-heap. Scheduling or cancelling a job wakes the task so it can
//! re-evaluate. Jobs run one at a time on that task, so a recurring job
//! never overlaps with itself.

use crate::session::SyncAgent;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rowsync_core::SyncType;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A scheduled unit of work.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Identifies a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Heap entry; the earliest due time compares greatest.
#[derive(Debug, Clone, Copy)]
struct Due {
    at: Instant,
    id: JobId,
}

impl PartialEq for Due {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}

impl Eq for Due {}

impl PartialOrd for Due {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Due {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earlier first, then lower id first.
        other.at.cmp(&self.at).then_with(|| other.id.cmp(&self.id))
    }
}

struct Entry {
    job: Job,
    every: Option<Duration>,
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Due>,
    jobs: HashMap<JobId, Entry>,
    next_id: u64,
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Notify,
    shutdown: CancellationToken,
}

/// Runs jobs at given instants or intervals.
pub struct SyncScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("pending", &self.pending())
            .field("shut_down", &self.shared.shutdown.is_cancelled())
            .finish()
    }
}

impl SyncScheduler {
    /// Creates a scheduler and spawns its worker on the current tokio
    /// runtime.
    pub fn start() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let worker = tokio::spawn(run(Arc::clone(&shared)));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Runs `job` once at `at`.
    pub fn schedule_at(&self, at: Instant, job: Job) -> JobId {
        self.insert(at, job, None)
    }

    /// Runs `job` every `interval`, the first time one interval from now.
    pub fn schedule_every(&self, interval: Duration, job: Job) -> JobId {
        self.insert(Instant::now() + interval, job, Some(interval))
    }

    /// Runs a session of `agent` at the agent's configured sync interval.
    ///
    /// Returns `None` if the agent has no interval configured. Session
    /// failures are logged; the next run is scheduled regardless.
    pub fn schedule_agent(&self, agent: Arc<SyncAgent>) -> Option<JobId> {
        let interval = agent.config().sync_interval?;
        let job: Job = Arc::new(move || {
            let agent = Arc::clone(&agent);
            async move {
                match agent.synchronize(SyncType::Normal).await {
                    Ok(result) => debug!(
                        session_id = %result.session_id,
                        uploaded = result.rows_uploaded(),
                        downloaded = result.rows_downloaded(),
                        "scheduled session completed"
                    ),
                    Err(e) => warn!(scope = %agent.config().scope_name, error = %e, "scheduled session failed"),
                }
            }
            .boxed()
        });
        Some(self.schedule_every(interval, job))
    }

    /// Cancels a job. Returns false if it was unknown or already ran.
    pub fn cancel(&self, id: JobId) -> bool {
        let removed = self.shared.queue.lock().jobs.remove(&id).is_some();
        if removed {
            self.shared.wake.notify_one();
        }
        removed
    }

    /// Returns the number of scheduled jobs.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Stops the worker after the running job, if any, completes. Pending
    /// jobs are dropped.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "scheduler worker ended abnormally");
            }
        }
        let mut queue = self.shared.queue.lock();
        queue.jobs.clear();
        queue.heap.clear();
        info!("scheduler stopped");
    }

    fn insert(&self, at: Instant, job: Job, every: Option<Duration>) -> JobId {
        let id = {
            let mut queue = self.shared.queue.lock();
            let id = JobId(queue.next_id);
            queue.next_id += 1;
            queue.jobs.insert(id, Entry { job, every });
            queue.heap.push(Due { at, id });
            id
        };
        debug!(job = %id, ?every, "job scheduled");
        self.shared.wake.notify_one();
        id
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

enum Next {
    Run(JobId, Job),
    SleepUntil(Instant),
    Idle,
}

fn next(queue: &mut Queue) -> Next {
    while let Some(due) = queue.heap.peek().copied() {
        let Some(entry) = queue.jobs.get(&due.id) else {
            // Cancelled.
            queue.heap.pop();
            continue;
        };
        if due.at > Instant::now() {
            return Next::SleepUntil(due.at);
        }
        let job = Arc::clone(&entry.job);
        let every = entry.every;
        queue.heap.pop();
        match every {
            Some(interval) => queue.heap.push(Due {
                at: Instant::now() + interval,
                id: due.id,
            }),
            None => {
                queue.jobs.remove(&due.id);
            }
        }
        return Next::Run(due.id, job);
    }
    Next::Idle
}

async fn run(shared: Arc<Shared>) {
    loop {
        let step = next(&mut shared.queue.lock());
        match step {
            Next::Run(id, job) => {
                debug!(job = %id, "running job");
                tokio::select! {
                    _ = shared.shutdown.cancelled() => return,
                    _ = job() => {}
                }
            }
            Next::SleepUntil(at) => {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => return,
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            Next::Idle => {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => return,
                    _ = shared.wake.notified() => {}
                }
            }
        }
    }
}

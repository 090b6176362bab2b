//! In-process job queues connecting the pipeline stages.
//!
//! A [`Queue`] is a multi producer, multi consumer channel with per-job ids.
//! Adding a job whose id is already known (waiting, running, or retained after
//! completion) is a no-op, which gives at most one downstream effect per id.
//! A [`QueueWorker`] drains a queue with a fixed pool of tasks and applies the
//! job's attempts and backoff policy to failures.

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    error::{ErrorKind, HasKind},
    metrics::Metrics,
};

/// Max number of finished job ids remembered for deduplication.
const RETAINED_JOBS: usize = 10_000;

/// Queue errors
#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    /// the channel is disconnected
    #[error("queue {0} is closed")]
    Closed(String),
}

impl HasKind for QueueError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Queue
    }
}

/// Per-job delivery options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Deduplication id. Generated when absent.
    pub job_id: Option<String>,
    /// Total number of times the job may run.
    pub attempts: u32,
    /// Base retry delay, multiplied by the number of attempts made.
    pub backoff: Duration,
    /// Delay before the first run.
    pub delay: Option<Duration>,
    /// Forget the id once the job succeeds, allowing it to be added again.
    pub remove_on_complete: bool,
    /// Forget the id once the job fails for good, allowing it to be added again.
    pub remove_on_fail: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            attempts: 3,
            backoff: Duration::from_secs(1),
            delay: None,
            remove_on_complete: true,
            remove_on_fail: false,
        }
    }
}

impl JobOptions {
    /// Options with the given job id.
    pub fn with_id(job_id: impl Into<String>) -> Self {
        Self { job_id: Some(job_id.into()), ..Default::default() }
    }
}

/// Lifecycle of a job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

/// A queued job.
#[derive(Debug, Clone)]
pub struct Job<J> {
    pub id: String,
    pub payload: J,
    pub options: JobOptions,
    /// Number of failed runs so far.
    pub attempts_made: u32,
}

struct Inner<J> {
    name: String,
    tx: flume::Sender<Job<J>>,
    rx: flume::Receiver<Job<J>>,
    jobs: DashMap<String, JobStatus>,
    retained: Mutex<VecDeque<String>>,
    next_id: AtomicU64,
}

/// Named job queue. Clones share the same channel.
pub struct Queue<J> {
    inner: Arc<Inner<J>>,
}

impl<J> Clone for Queue<J> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<J> fmt::Debug for Queue<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("waiting", &self.inner.rx.len())
            .finish_non_exhaustive()
    }
}

impl<J: Send + 'static> Queue<J> {
    /// Create a new [Self].
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                tx,
                rx,
                jobs: DashMap::new(),
                retained: Mutex::new(VecDeque::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Name of the queue.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add a job. Returns the job id, or [None] if a job with the same id is
    /// already known to this queue.
    pub fn add(&self, payload: J, options: JobOptions) -> Result<Option<String>, QueueError> {
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string());

        match self.inner.jobs.entry(id.clone()) {
            Entry::Occupied(_) => {
                debug!(queue = self.inner.name, id, "duplicate job ignored");
                return Ok(None);
            }
            Entry::Vacant(entry) => {
                entry.insert(JobStatus::Waiting);
            }
        }

        let delay = options.delay;
        let job = Job { id: id.clone(), payload, options, attempts_made: 0 };
        match delay {
            Some(delay) => self.send_after(job, delay),
            None => self.send(job)?,
        }

        Ok(Some(id))
    }

    /// Whether `id` is waiting, running, or retained.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.jobs.contains_key(id)
    }

    /// Current status of `id`.
    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.inner.jobs.get(id).map(|s| *s)
    }

    /// Forget `id` so that it may be added again. A job already in the channel
    /// still runs.
    pub fn remove(&self, id: &str) -> bool {
        self.inner.jobs.remove(id).is_some()
    }

    /// Number of jobs waiting in the channel.
    pub fn len(&self) -> usize {
        self.inner.rx.len()
    }

    /// Whether no job is waiting in the channel.
    pub fn is_empty(&self) -> bool {
        self.inner.rx.is_empty()
    }

    /// Drain waiting jobs without running them.
    #[cfg(test)]
    pub(crate) fn take_waiting(&self) -> Vec<Job<J>> {
        self.inner.rx.try_iter().collect()
    }

    fn send(&self, job: Job<J>) -> Result<(), QueueError> {
        self.inner.tx.send(job).map_err(|_| QueueError::Closed(self.inner.name.clone()))
    }

    fn send_after(&self, job: Job<J>, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(error) = queue.send(job) {
                error!(?error, "failed to enqueue delayed job");
            }
        });
    }

    fn finish(&self, id: &str, status: JobStatus, remove: bool) {
        if remove {
            self.inner.jobs.remove(id);
            return;
        }

        self.inner.jobs.insert(id.to_string(), status);
        let mut retained = self.inner.retained.lock();
        retained.push_back(id.to_string());
        while retained.len() > RETAINED_JOBS {
            if let Some(old) = retained.pop_front() {
                self.inner.jobs.remove(&old);
            }
        }
    }
}

/// Job handler for a [`QueueWorker`].
#[async_trait]
pub trait Processor<J>: Send + Sync + 'static {
    /// Error returned by a failed run.
    type Error: std::error::Error + HasKind + Send + Sync + 'static;

    /// Run a job.
    async fn process(&self, job: &Job<J>) -> Result<(), Self::Error>;
}

/// Pool of tasks draining one queue.
#[derive(Debug)]
pub struct QueueWorker {
    name: String,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl QueueWorker {
    /// Spawn `concurrency` tasks running `processor` over `queue`.
    pub fn spawn<J, P>(
        queue: Queue<J>,
        processor: Arc<P>,
        concurrency: usize,
        metrics: Arc<Metrics>,
    ) -> Self
    where
        J: Send + Sync + 'static,
        P: Processor<J>,
    {
        let cancel = CancellationToken::new();
        let tasks = (0..concurrency.max(1))
            .map(|_| {
                let queue = queue.clone();
                let processor = Arc::clone(&processor);
                let metrics = Arc::clone(&metrics);
                let cancel = cancel.clone();
                tokio::spawn(async move { run(queue, processor, metrics, cancel).await })
            })
            .collect();

        Self { name: queue.name().to_string(), cancel, tasks }
    }

    /// Stop taking new jobs and wait for jobs in flight to finish.
    pub async fn close(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(error) = task.await {
                error!(?error, queue = self.name, "queue worker task failed");
            }
        }
        debug!(queue = self.name, "queue worker closed");
    }
}

async fn run<J, P>(queue: Queue<J>, processor: Arc<P>, metrics: Arc<Metrics>, cancel: CancellationToken)
where
    J: Send + Sync + 'static,
    P: Processor<J>,
{
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = queue.inner.rx.recv_async() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
        };

        // Removed while waiting.
        if !queue.contains(&job.id) {
            continue;
        }
        queue.inner.jobs.insert(job.id.clone(), JobStatus::Active);

        match processor.process(&job).await {
            Ok(()) => queue.finish(&job.id, JobStatus::Completed, job.options.remove_on_complete),
            Err(err) => fail(&queue, job, &err, &metrics),
        }
    }
}

fn fail<J, E>(queue: &Queue<J>, mut job: Job<J>, err: &E, metrics: &Metrics)
where
    J: Send + 'static,
    E: std::error::Error + HasKind,
{
    let kind = err.kind();
    metrics.incr_job_err(queue.name(), kind);
    job.attempts_made += 1;

    if kind.is_unrecoverable() || job.attempts_made >= job.options.attempts {
        error!(
            queue = queue.name(),
            id = job.id,
            attempts = job.attempts_made,
            kind = kind.as_ref(),
            %err,
            "job failed"
        );
        queue.finish(&job.id, JobStatus::Failed, job.options.remove_on_fail);
        return;
    }

    let delay = job.options.backoff * job.attempts_made;
    warn!(
        queue = queue.name(),
        id = job.id,
        attempts = job.attempts_made,
        ?delay,
        %err,
        "job failed, retrying"
    );
    queue.inner.jobs.insert(job.id.clone(), JobStatus::Waiting);
    queue.send_after(job, delay);
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;
    use std::sync::atomic::AtomicU32;

    #[derive(thiserror::Error, Debug)]
    #[error("boom")]
    struct Boom(ErrorKind);

    impl HasKind for Boom {
        fn kind(&self) -> ErrorKind {
            self.0
        }
    }

    #[derive(Debug)]
    struct FailTimes {
        failures: u32,
        kind: ErrorKind,
        runs: AtomicU32,
    }

    #[async_trait]
    impl Processor<u32> for FailTimes {
        type Error = Boom;

        async fn process(&self, _job: &Job<u32>) -> Result<(), Boom> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.failures {
                Err(Boom(self.kind))
            } else {
                Ok(())
            }
        }
    }

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new(&Registry::new()).unwrap())
    }

    fn fast(id: &str, attempts: u32) -> JobOptions {
        JobOptions {
            attempts,
            backoff: Duration::from_millis(5),
            remove_on_complete: false,
            ..JobOptions::with_id(id)
        }
    }

    async fn wait_for(queue: &Queue<u32>, id: &str, status: JobStatus) {
        for _ in 0..200 {
            if queue.status(id) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never reached {status:?}, at {:?}", queue.status(id));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let queue = Queue::new("dev-reporter-vrf");
        assert_eq!(queue.add(1, JobOptions::with_id("7")).unwrap(), Some("7".to_string()));
        assert_eq!(queue.add(2, JobOptions::with_id("7")).unwrap(), None);
        assert_eq!(queue.len(), 1);

        let generated = queue.add(3, JobOptions::default()).unwrap();
        assert!(generated.is_some());
        assert_eq!(queue.len(), 2);

        assert!(queue.remove("7"));
        assert!(queue.add(4, JobOptions::with_id("7")).unwrap().is_some());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let queue = Queue::new("dev-worker-vrf");
        let processor = Arc::new(FailTimes {
            failures: 2,
            kind: ErrorKind::TransientChain,
            runs: AtomicU32::new(0),
        });
        let worker = QueueWorker::spawn(queue.clone(), Arc::clone(&processor), 1, metrics());

        queue.add(1, fast("a", 3)).unwrap();
        wait_for(&queue, "a", JobStatus::Completed).await;
        assert_eq!(processor.runs.load(Ordering::SeqCst), 3);

        // Completed ids are retained.
        assert_eq!(queue.add(1, fast("a", 3)).unwrap(), None);
        worker.close().await;
    }

    #[tokio::test]
    async fn unrecoverable_failures_are_not_retried() {
        let queue = Queue::new("dev-reporter-data-feed");
        let processor = Arc::new(FailTimes {
            failures: 10,
            kind: ErrorKind::WalletAbsent,
            runs: AtomicU32::new(0),
        });
        let worker = QueueWorker::spawn(queue.clone(), Arc::clone(&processor), 2, metrics());

        queue.add(1, fast("b", 5)).unwrap();
        wait_for(&queue, "b", JobStatus::Failed).await;
        assert_eq!(processor.runs.load(Ordering::SeqCst), 1);
        worker.close().await;
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let queue = Queue::new("dev-worker-data-feed");
        let processor = Arc::new(FailTimes {
            failures: 10,
            kind: ErrorKind::DataSource,
            runs: AtomicU32::new(0),
        });
        let worker = QueueWorker::spawn(queue.clone(), Arc::clone(&processor), 1, metrics());

        queue.add(1, JobOptions { remove_on_fail: true, ..fast("c", 2) }).unwrap();
        for _ in 0..200 {
            if !queue.contains("c") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!queue.contains("c"));
        assert_eq!(processor.runs.load(Ordering::SeqCst), 2);
        worker.close().await;
    }
}

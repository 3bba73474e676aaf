//! Job controller: deduplication, cache filter and the admission loop.
//!
//! One [`JobController::run`] call takes a batch of jobs through three phases:
//!
//! 1. jobs sharing a composite identity are collapsed, first one wins;
//! 2. unless `force` is set, jobs whose results are already committed are
//!    answered from the store by a bounded pool of lookup tasks;
//! 3. the remaining jobs are admitted FIFO while fewer than `max_concurrent`
//!    run, polled every cycle and cancelled once they exceed their timeout.
//!
//! The admission loop is a single task. Running jobs are owned by it and
//! never shared, so they need no locking.

use crate::backend::{Backend, BackendSet, JobHandle, JobPaths, PollStatus};
use crate::error::{Result, SimconError};
use crate::hash::Digest;
use crate::job::{Dataset, Job, JobBatch, JobId, ResultSet};
use crate::store::{log_tail, ResultStore, StoreKey};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Number of log lines kept for failed jobs.
pub const LOG_TAIL_LINES: usize = 20;

/// Options of one controller run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Ignore cached results and run every job again.
    pub force: bool,
    /// Delete the store entries of every job after the run.
    pub remove_results: bool,
}

impl RunOptions {
    /// Sets `force`.
    #[must_use]
    pub const fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Sets `remove_results`.
    #[must_use]
    pub const fn remove_results(mut self, remove: bool) -> Self {
        self.remove_results = remove;
        self
    }
}

/// Terminal state of one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Results were already in the store.
    Cached,
    /// Ran, validated and committed.
    Succeeded,
    /// Did not produce valid results.
    Failed {
        /// Human-readable reason.
        reason: String,
        /// Last lines of `sim.log`, if any.
        log_tail: Option<String>,
    },
    /// Exceeded its timeout and was cancelled.
    TimedOut {
        /// Time the job had been running.
        elapsed: Duration,
        /// Last lines of `sim.log`, if any.
        log_tail: Option<String>,
    },
}

impl JobOutcome {
    /// Returns true for `Failed` and `TimedOut`.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::TimedOut { .. })
    }

    /// Returns true unless the job was answered from the store.
    #[must_use]
    pub const fn was_dispatched(&self) -> bool {
        !matches!(self, Self::Cached)
    }

    /// Returns the captured log tail of a failed job.
    #[must_use]
    pub fn log_tail(&self) -> Option<&str> {
        match self {
            Self::Failed { log_tail, .. } | Self::TimedOut { log_tail, .. } => log_tail.as_deref(),
            _ => None,
        }
    }
}

/// Per-job entry of a [`RunReport`].
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Composite identity.
    pub job_id: JobId,
    /// `<device>/<sweep>` label.
    pub label: String,
    /// Local job directory.
    pub workdir: PathBuf,
    /// What happened.
    pub outcome: JobOutcome,
}

/// Result of a controller run.
#[derive(Debug, Clone)]
pub struct RunReport {
    run_id: Uuid,
    records: Vec<JobRecord>,
    datasets: HashMap<Digest, Dataset>,
    peak_running: usize,
}

impl RunReport {
    /// Returns the id of this run, as logged in the `run` span.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns true if no job failed or timed out.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.records.iter().any(|r| r.outcome.is_failure())
    }

    /// Returns true if at least one job was dispatched.
    #[must_use]
    pub fn ran_any(&self) -> bool {
        self.records.iter().any(|r| r.outcome.was_dispatched())
    }

    /// Returns the per-job records, in completion order.
    #[must_use]
    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    /// Returns the record of one job.
    #[must_use]
    pub fn record(&self, job_id: JobId) -> Option<&JobRecord> {
        self.records.iter().find(|r| r.job_id == job_id)
    }

    /// Returns the datasets, keyed by device identity.
    #[must_use]
    pub const fn datasets(&self) -> &HashMap<Digest, Dataset> {
        &self.datasets
    }

    /// Returns the dataset of one device.
    #[must_use]
    pub fn dataset(&self, device_identity: Digest) -> Option<&Dataset> {
        self.datasets.get(&device_identity)
    }

    /// Returns the largest number of jobs observed running at once.
    #[must_use]
    pub const fn peak_running(&self) -> usize {
        self.peak_running
    }

    /// Counts records matching `predicate`.
    fn count(&self, predicate: impl Fn(&JobOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| predicate(&r.outcome)).count()
    }

    /// Number of jobs answered from the store.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Cached))
    }

    /// Number of jobs that ran and succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Succeeded))
    }

    /// Number of jobs that failed or timed out.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(JobOutcome::is_failure)
    }
}

/// A dispatched job owned by the admission loop.
struct RunningJob {
    job: Job,
    key: StoreKey,
    paths: JobPaths,
    backend: Arc<dyn Backend>,
    handle: JobHandle,
    started: Instant,
    timeout: Duration,
}

/// What one poll cycle did to a running job.
enum Step {
    Running(RunningJob),
    Finished(RunningJob, JobOutcome, Option<ResultSet>),
}

enum CacheLookup {
    Hit(ResultSet),
    Miss,
}

/// Runs batches of simulation jobs against a result store.
///
/// # Example
///
/// ```no_run
/// use simcon::backend::local::LocalBackend;
/// use simcon::controller::{JobController, RunOptions};
/// use simcon::job::JobBatch;
/// use simcon::store::ResultStore;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> simcon::error::Result<()> {
///     let controller = JobController::builder()
///         .store(ResultStore::new("./simulations".into())?)
///         .backend(Arc::new(LocalBackend::new()))
///         .max_concurrent(4)
///         .build()?;
///
///     let report = controller.run(JobBatch::new(), RunOptions::default()).await?;
///     assert!(report.success());
///     Ok(())
/// }
/// ```
pub struct JobController {
    store: ResultStore,
    backends: BackendSet,
    max_concurrent: usize,
    timeout: Duration,
    poll_interval: Duration,
    cache_workers: usize,
}

impl JobController {
    /// Creates a controller builder.
    #[must_use]
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::default()
    }

    /// Returns the result store.
    #[must_use]
    pub const fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Returns the concurrency bound.
    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Returns the global timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs a batch to completion.
    ///
    /// Per-job problems end up in the report. Only invocation-level problems
    /// are returned as errors.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if a remote session cannot be established; running
    /// jobs are cancelled first.
    pub async fn run(&self, batch: JobBatch, options: RunOptions) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);
        self.run_batch(run_id, batch, options).instrument(span).await
    }

    async fn run_batch(
        &self,
        run_id: Uuid,
        batch: JobBatch,
        options: RunOptions,
    ) -> Result<RunReport> {
        let submitted = batch.len();
        let jobs = batch.deduplicate();
        info!(
            "Starting run: {} unique job(s) of {submitted} submitted, max {} concurrent",
            jobs.len(),
            self.max_concurrent
        );

        let mut report = RunReport {
            run_id,
            records: Vec::with_capacity(jobs.len()),
            datasets: HashMap::new(),
            peak_running: 0,
        };
        let keys: Vec<StoreKey> = jobs.iter().map(|job| self.store.key(job)).collect();

        let queue = if options.force {
            jobs.into_iter().collect()
        } else {
            self.filter_cached(jobs, &keys, &mut report).await
        };

        let outcome = self.admission_loop(queue, options, &mut report).await;
        self.teardown().await;
        outcome?;

        if options.remove_results {
            for key in &keys {
                if let Err(e) = self.store.delete(key) {
                    warn!("Failed to remove results of job {}: {e}", key.job_id);
                }
            }
            info!("Removed results of {} job(s)", keys.len());
        }

        info!(
            "Run finished: {} succeeded, {} cached, {} failed",
            report.succeeded(),
            report.cached(),
            report.failed()
        );
        Ok(report)
    }

    /// Answers jobs from the store; returns the ones that must run.
    async fn filter_cached(
        &self,
        jobs: Vec<Job>,
        keys: &[StoreKey],
        report: &mut RunReport,
    ) -> VecDeque<Job> {
        let semaphore = Arc::new(Semaphore::new(self.cache_workers));
        let found: Arc<Mutex<Vec<(usize, CacheLookup)>>> =
            Arc::new(Mutex::new(Vec::with_capacity(jobs.len())));
        let mut lookups = JoinSet::new();

        for (index, key) in keys.iter().enumerate() {
            let store = self.store.clone();
            let key = key.clone();
            let semaphore = Arc::clone(&semaphore);
            let found = Arc::clone(&found);
            lookups.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let lookup = tokio::task::spawn_blocking(move || lookup_cached(&store, &key))
                    .await
                    .unwrap_or(CacheLookup::Miss);
                found.lock().await.push((index, lookup));
            });
        }
        while let Some(joined) = lookups.join_next().await {
            if let Err(e) = joined {
                warn!("Cache lookup task failed: {e}");
            }
        }

        let mut hits: HashMap<usize, ResultSet> = HashMap::new();
        for (index, lookup) in std::mem::take(&mut *found.lock().await) {
            if let CacheLookup::Hit(results) = lookup {
                hits.insert(index, results);
            }
        }

        let mut queue = VecDeque::with_capacity(jobs.len() - hits.len());
        for (index, (job, key)) in jobs.into_iter().zip(keys).enumerate() {
            match hits.remove(&index) {
                Some(results) => {
                    debug!("{} answered from cache", job.label());
                    self.record(report, &job, key, JobOutcome::Cached, Some(results));
                }
                None => queue.push_back(job),
            }
        }
        info!(
            "Cache filter: {} cached, {} to run",
            report.cached(),
            queue.len()
        );
        queue
    }

    async fn admission_loop(
        &self,
        mut queue: VecDeque<Job>,
        options: RunOptions,
        report: &mut RunReport,
    ) -> Result<()> {
        let mut running: Vec<RunningJob> = Vec::with_capacity(self.max_concurrent);

        while !queue.is_empty() || !running.is_empty() {
            while running.len() < self.max_concurrent {
                let Some(job) = queue.pop_front() else {
                    break;
                };
                match self.admit(job, options).await {
                    Ok(admitted) => running.push(admitted),
                    Err((job, _, e)) if e.is_transport() => {
                        error!("Aborting run, {} could not be dispatched: {e}", job.label());
                        self.abort(running).await;
                        return Err(e);
                    }
                    Err((job, key, e)) => {
                        warn!("Failed to dispatch {}: {e}", job.label());
                        let workdir = self.store.working_dir(&key);
                        let outcome = JobOutcome::Failed {
                            reason: e.to_string(),
                            log_tail: log_tail(&workdir, LOG_TAIL_LINES),
                        };
                        self.record(report, &job, &key, outcome, None);
                    }
                }
            }
            report.peak_running = report.peak_running.max(running.len());

            let mut still_running = Vec::with_capacity(running.len());
            for job in running {
                match self.step(job).await {
                    Step::Running(job) => still_running.push(job),
                    Step::Finished(job, outcome, results) => {
                        self.record(report, &job.job, &job.key, outcome, results);
                        job.backend.retire(job.handle).await;
                    }
                }
            }
            running = still_running;

            if !queue.is_empty() || !running.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Ok(())
    }

    /// Materializes, prepares and dispatches one job.
    async fn admit(
        &self,
        job: Job,
        options: RunOptions,
    ) -> std::result::Result<RunningJob, (Job, StoreKey, SimconError)> {
        let key = self.store.key(&job);
        match self.try_admit(&job, &key, options).await {
            Ok((paths, backend, handle)) => {
                let timeout = job
                    .device()
                    .timeout_override()
                    .map_or(self.timeout, |t| t.max(self.timeout));
                info!("Dispatched {} as {}", job.label(), handle.describe());
                Ok(RunningJob {
                    job,
                    key,
                    paths,
                    backend,
                    handle,
                    started: Instant::now(),
                    timeout,
                })
            }
            Err(e) => Err((job, key, e)),
        }
    }

    async fn try_admit(
        &self,
        job: &Job,
        key: &StoreKey,
        options: RunOptions,
    ) -> Result<(JobPaths, Arc<dyn Backend>, JobHandle)> {
        let backend = Arc::clone(self.backends.get(job.device().backend_kind())?);
        if options.force {
            self.store.delete(key)?;
        }
        let workdir = self.store.materialize(key)?;
        job.device().prepare(job.sweep(), &workdir)?;

        let paths = JobPaths::new(self.store.root(), key.relative_path());
        let handle = backend.dispatch(job, &paths).await?;
        Ok((paths, backend, handle))
    }

    /// Polls one running job and applies the timeout.
    async fn step(&self, mut running: RunningJob) -> Step {
        let status = running.backend.poll(&mut running.handle).await;
        match status {
            Ok(PollStatus::Succeeded) => match self.complete(running).await {
                Step::Running(deferred) => running = deferred,
                finished @ Step::Finished(..) => return finished,
            },
            Ok(PollStatus::Failed { reason }) => {
                warn!("{} failed: {reason}", running.job.label());
                self.salvage(&running).await;
                let log_tail = log_tail(&running.paths.workdir(), LOG_TAIL_LINES);
                return Step::Finished(running, JobOutcome::Failed { reason, log_tail }, None);
            }
            Ok(PollStatus::Pending) => {}
            Err(e) if e.is_transient() => {
                debug!("Poll of {} deferred: {e}", running.job.label());
            }
            Err(e) => {
                warn!("Poll of {} failed: {e}", running.job.label());
                let log_tail = log_tail(&running.paths.workdir(), LOG_TAIL_LINES);
                let outcome = JobOutcome::Failed {
                    reason: e.to_string(),
                    log_tail,
                };
                return Step::Finished(running, outcome, None);
            }
        }

        let elapsed = running.started.elapsed();
        if elapsed <= running.timeout {
            return Step::Running(running);
        }

        warn!(
            "{} exceeded its timeout of {:?}, cancelling",
            running.job.label(),
            running.timeout
        );
        let cancelled = running.backend.cancel(&mut running.handle).await;
        if let Err(e) = cancelled {
            warn!(
                "Cancel of {} failed, the process may keep running: {e}",
                running.handle.describe()
            );
        }
        self.salvage(&running).await;
        let log_tail = log_tail(&running.paths.workdir(), LOG_TAIL_LINES);
        Step::Finished(running, JobOutcome::TimedOut { elapsed, log_tail }, None)
    }

    /// Fetches, validates, parses and commits a finished job.
    async fn complete(&self, running: RunningJob) -> Step {
        let fetched = running.backend.fetch(&running.handle).await;
        if let Err(e) = fetched {
            if e.is_transient() {
                debug!("Fetch of {} deferred: {e}", running.job.label());
                return Step::Running(running);
            }
            return Self::failed(running, &e);
        }

        let workdir = running.paths.workdir();
        let device = running.job.device();
        let sweep = running.job.sweep();
        let committed = device
            .validate(sweep, &workdir)
            .and_then(|()| device.parse_results(sweep, &workdir))
            .and_then(|results| {
                self.store.commit(&running.key, &results)?;
                Ok(results)
            });

        match committed {
            Ok(results) => {
                info!(
                    "{} succeeded after {:?}",
                    running.job.label(),
                    running.started.elapsed()
                );
                Step::Finished(running, JobOutcome::Succeeded, Some(results))
            }
            Err(e) => {
                warn!("{} produced no valid results: {e}", running.job.label());
                Self::failed(running, &e)
            }
        }
    }

    fn failed(running: RunningJob, e: &SimconError) -> Step {
        let log_tail = log_tail(&running.paths.workdir(), LOG_TAIL_LINES);
        let outcome = JobOutcome::Failed {
            reason: e.to_string(),
            log_tail,
        };
        Step::Finished(running, outcome, None)
    }

    /// Brings the log of a failed remote job home, if possible.
    async fn salvage(&self, running: &RunningJob) {
        if !running.job.device().backend_kind().is_remote() {
            return;
        }
        let fetched = running.backend.fetch(&running.handle).await;
        if let Err(e) = fetched {
            debug!("Could not fetch {} after failure: {e}", running.job.label());
        }
    }

    fn record(
        &self,
        report: &mut RunReport,
        job: &Job,
        key: &StoreKey,
        outcome: JobOutcome,
        results: Option<ResultSet>,
    ) {
        if let Some(results) = results {
            report
                .datasets
                .entry(job.device_identity())
                .or_default()
                .merge(job.sweep_dir_name(), results);
        }
        report.records.push(JobRecord {
            job_id: job.id(),
            label: job.label(),
            workdir: self.store.working_dir(key),
            outcome,
        });
    }

    async fn abort(&self, running: Vec<RunningJob>) {
        for mut job in running {
            let cancelled = job.backend.cancel(&mut job.handle).await;
            if let Err(e) = cancelled {
                warn!("Cancel of {} failed: {e}", job.handle.describe());
            }
            job.backend.retire(job.handle).await;
        }
    }

    async fn teardown(&self) {
        for backend in self.backends.iter() {
            backend.shutdown().await;
        }
    }
}

fn lookup_cached(store: &ResultStore, key: &StoreKey) -> CacheLookup {
    if store.exists(key) {
        match store.load(key) {
            Ok(results) => return CacheLookup::Hit(results),
            Err(e) => warn!(
                "Discarding unreadable results in {}: {e}",
                store.working_dir(key).display()
            ),
        }
    } else if store.is_stale(key) {
        info!(
            "Deleting uncommitted job directory {}",
            store.working_dir(key).display()
        );
    } else {
        return CacheLookup::Miss;
    }
    if let Err(e) = store.delete(key) {
        warn!("{e}");
    }
    CacheLookup::Miss
}

/// Builder for `JobController`.
#[derive(Default)]
pub struct ControllerBuilder {
    store: Option<ResultStore>,
    backends: BackendSet,
    max_concurrent: Option<usize>,
    timeout: Option<Duration>,
    poll_interval: Option<Duration>,
    cache_workers: Option<usize>,
}

impl ControllerBuilder {
    /// Sets the result store.
    #[must_use]
    pub fn store(mut self, store: ResultStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Registers a backend.
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend);
        self
    }

    /// Replaces all backends.
    #[must_use]
    pub fn backends(mut self, backends: BackendSet) -> Self {
        self.backends = backends;
        self
    }

    /// Sets the concurrency bound. Defaults to the number of CPUs.
    #[must_use]
    pub const fn max_concurrent(mut self, count: usize) -> Self {
        self.max_concurrent = Some(count);
        self
    }

    /// Sets the global per-job timeout. Defaults to 30 s.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the sleep between admission-loop cycles. Defaults to 100 ms.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Sets the number of parallel cache lookups. Defaults to the number of CPUs.
    #[must_use]
    pub const fn cache_workers(mut self, count: usize) -> Self {
        self.cache_workers = Some(count);
        self
    }

    /// Builds the controller.
    ///
    /// # Errors
    ///
    /// Returns an error if no store is set or a bound is zero.
    pub fn build(self) -> Result<JobController> {
        let store = self
            .store
            .ok_or_else(|| SimconError::Config("a result store is required".to_string()))?;
        let max_concurrent = self.max_concurrent.unwrap_or_else(num_cpus::get);
        let cache_workers = self.cache_workers.unwrap_or_else(num_cpus::get);
        let timeout = self.timeout.unwrap_or(Duration::from_secs(30));
        let poll_interval = self.poll_interval.unwrap_or(Duration::from_millis(100));

        if max_concurrent == 0 || cache_workers == 0 {
            return Err(SimconError::Config(
                "max_concurrent and cache_workers must be at least 1".to_string(),
            ));
        }
        if timeout.is_zero() || poll_interval.is_zero() {
            return Err(SimconError::Config(
                "timeout and poll interval must be positive".to_string(),
            ));
        }

        info!(
            "JobController initialized: {max_concurrent} concurrent, timeout {timeout:?}, store {}",
            store.root().display()
        );
        Ok(JobController {
            store,
            backends: self.backends,
            max_concurrent,
            timeout,
            poll_interval,
            cache_workers,
        })
    }
}

#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Controller tests against a scripted in-memory backend.
//!
//! Time is paused, so job durations and timeouts are exact and the tests do
//! not sleep for real.

use simcon::backend::{Backend, BoxFuture, JobHandle, JobPaths, PollStatus};
use simcon::controller::{JobController, JobOutcome, RunOptions};
use simcon::error::{Result, SimconError};
use simcon::hash::{fingerprint, Digest};
use simcon::job::{BackendKind, Device, Job, JobBatch, ResultSet, StartCommand};
use simcon::store::ResultStore;
use simcon::sweep::Sweep;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const POLL: Duration = Duration::from_millis(100);

/// What the scripted backend does with a device's job.
#[derive(Debug, Clone, Copy)]
enum Plan {
    Succeed(Duration),
    Fail(Duration),
    Hang,
    TransportOnDispatch,
    Flaky { transient_polls: usize, after: Duration },
    /// Reports success at once, but its outputs can never be fetched.
    FetchUnavailable,
    /// Never finishes and cannot be cancelled.
    Uncancellable,
}

struct Entry {
    name: String,
    plan: Plan,
    started: Instant,
    workdir: PathBuf,
    polls: usize,
    done: bool,
}

#[derive(Default)]
struct ScriptedBackend {
    plans: Mutex<HashMap<String, Plan>>,
    jobs: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    running: AtomicUsize,
    peak: AtomicUsize,
    dispatched: Mutex<Vec<(String, Instant)>>,
    finished: Mutex<Vec<(String, Instant)>>,
    cancelled: Mutex<Vec<String>>,
    shutdowns: AtomicUsize,
}

impl ScriptedBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn plan(&self, device: &str, plan: Plan) {
        self.plans.lock().unwrap().insert(device.to_string(), plan);
    }

    fn dispatched_names(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn dispatched_at(&self, name: &str) -> Instant {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, at)| *at)
            .unwrap()
    }

    fn finished_at(&self, name: &str) -> Instant {
        self.finished
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, at)| *at)
            .unwrap()
    }

    fn leave(&self, name: &str) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.finished
            .lock()
            .unwrap()
            .push((name.to_string(), Instant::now()));
    }

    fn id(handle: &JobHandle) -> u64 {
        match handle {
            JobHandle::External(id) => *id,
            other => panic!("unexpected handle {}", other.describe()),
        }
    }
}

impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn dispatch<'a>(
        &'a self,
        job: &'a Job,
        paths: &'a JobPaths,
    ) -> BoxFuture<'a, Result<JobHandle>> {
        Box::pin(async move {
            let name = job.device().name().to_string();
            let plan = self
                .plans
                .lock()
                .unwrap()
                .get(&name)
                .copied()
                .unwrap_or(Plan::Succeed(Duration::from_millis(300)));

            if matches!(plan, Plan::TransportOnDispatch) {
                return Err(SimconError::Transport {
                    host: "cluster".to_string(),
                    message: "connection refused".to_string(),
                });
            }

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.dispatched
                .lock()
                .unwrap()
                .push((name.clone(), Instant::now()));

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.jobs.lock().unwrap().insert(
                id,
                Entry {
                    name,
                    plan,
                    started: Instant::now(),
                    workdir: paths.workdir(),
                    polls: 0,
                    done: false,
                },
            );
            Ok(JobHandle::External(id))
        })
    }

    fn poll<'a>(&'a self, handle: &'a mut JobHandle) -> BoxFuture<'a, Result<PollStatus>> {
        Box::pin(async move {
            let id = Self::id(handle);
            let mut jobs = self.jobs.lock().unwrap();
            let entry = jobs.get_mut(&id).unwrap();
            entry.polls += 1;
            let elapsed = entry.started.elapsed();

            let status = match entry.plan {
                Plan::Succeed(d) if elapsed >= d => PollStatus::Succeeded,
                Plan::Fail(d) if elapsed >= d => PollStatus::Failed {
                    reason: "exit code 1".to_string(),
                },
                Plan::Flaky {
                    transient_polls, ..
                } if entry.polls <= transient_polls => {
                    return Err(SimconError::TransientPoll {
                        message: "status command timed out".to_string(),
                    });
                }
                Plan::Flaky { after, .. } if elapsed >= after => PollStatus::Succeeded,
                Plan::FetchUnavailable => PollStatus::Succeeded,
                _ => PollStatus::Pending,
            };

            if status != PollStatus::Pending && !entry.done {
                entry.done = true;
                let name = entry.name.clone();
                drop(jobs);
                self.leave(&name);
            }
            Ok(status)
        })
    }

    fn fetch<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let (plan, workdir) = {
                let jobs = self.jobs.lock().unwrap();
                let entry = &jobs[&Self::id(handle)];
                (entry.plan, entry.workdir.clone())
            };
            if matches!(plan, Plan::FetchUnavailable) {
                return Err(SimconError::TransientPoll {
                    message: "scp: connection reset".to_string(),
                });
            }
            let input = std::fs::read_to_string(workdir.join("input.txt"))?;
            std::fs::write(workdir.join("output.dat"), format!("{}\n", input.len()))?;
            Ok(())
        })
    }

    fn cancel<'a>(&'a self, handle: &'a mut JobHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let (name, plan, was_done) = {
                let mut jobs = self.jobs.lock().unwrap();
                let entry = jobs.get_mut(&Self::id(handle)).unwrap();
                let was_done = std::mem::replace(&mut entry.done, true);
                (entry.name.clone(), entry.plan, was_done)
            };
            self.cancelled.lock().unwrap().push(name.clone());
            if matches!(plan, Plan::Uncancellable) {
                return Err(SimconError::Unsupported {
                    backend: "scripted",
                    operation: "cancel",
                });
            }
            if !was_done {
                self.leave(&name);
            }
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        })
    }
}

/// Device that writes its payload as input and reads back `output.dat`.
struct TestDevice {
    name: String,
    payload: String,
    timeout: Option<Duration>,
    nan: bool,
}

impl TestDevice {
    fn new(name: &str) -> Arc<dyn Device> {
        Arc::new(Self {
            name: name.to_string(),
            payload: format!("card of {name}"),
            timeout: None,
            nan: false,
        })
    }

    fn with_timeout(name: &str, timeout: Duration) -> Arc<dyn Device> {
        Arc::new(Self {
            name: name.to_string(),
            payload: format!("card of {name}"),
            timeout: Some(timeout),
            nan: false,
        })
    }
}

impl Device for TestDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn identity(&self) -> Digest {
        fingerprint([self.name.as_str(), self.payload.as_str()])
    }

    fn prepare(&self, _sweep: &Sweep, workdir: &Path) -> Result<()> {
        std::fs::write(workdir.join("input.txt"), &self.payload)?;
        Ok(())
    }

    fn start_command(&self) -> StartCommand {
        StartCommand::new("simulate", ["input.txt"])
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn validate(&self, _sweep: &Sweep, workdir: &Path) -> Result<()> {
        if workdir.join("output.dat").is_file() {
            Ok(())
        } else {
            Err(SimconError::SimulationIncomplete {
                reason: "output.dat missing".to_string(),
            })
        }
    }

    fn parse_results(&self, _sweep: &Sweep, workdir: &Path) -> Result<ResultSet> {
        let text = std::fs::read_to_string(workdir.join("output.dat"))?;
        let value: f64 = text
            .trim()
            .parse()
            .map_err(|e| SimconError::Serialization(format!("bad output: {e}")))?;
        let values = if self.nan {
            vec![value, f64::NAN]
        } else {
            vec![value]
        };
        Ok(ResultSet::new().with_column("len", values))
    }

    fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }
}

fn sweep(name: &str) -> Arc<Sweep> {
    Arc::new(Sweep::builder(name).linear("V", 0.0, 1.0, 3).build().unwrap())
}

fn controller(
    root: &Path,
    backend: &Arc<ScriptedBackend>,
    max_concurrent: usize,
    timeout: Duration,
) -> JobController {
    JobController::builder()
        .store(ResultStore::new(root.join("simulations")).unwrap())
        .backend(Arc::clone(backend) as Arc<dyn Backend>)
        .max_concurrent(max_concurrent)
        .timeout(timeout)
        .poll_interval(POLL)
        .build()
        .unwrap()
}

fn batch(names: &[&str]) -> JobBatch {
    let devices: Vec<Arc<dyn Device>> = names.iter().map(|n| TestDevice::new(n)).collect();
    JobBatch::new().add_product(&devices, &[sweep("dc")])
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_never_exceeds_bound() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    for (i, name) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
        let millis = 200 + 100 * u64::try_from(i).unwrap();
        backend.plan(name, Plan::Succeed(Duration::from_millis(millis)));
    }
    let controller = controller(tmp.path(), &backend, 2, Duration::from_secs(30));

    let report = controller
        .run(batch(&["a", "b", "c", "d", "e", "f"]), RunOptions::default())
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.succeeded(), 6);
    assert_eq!(backend.peak.load(Ordering::SeqCst), 2);
    assert!(report.peak_running() <= 2);
    assert_eq!(backend.running.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_admission_is_fifo_and_waits_for_a_free_slot() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.plan("long", Plan::Succeed(Duration::from_secs(2)));
    backend.plan("short", Plan::Succeed(Duration::from_millis(300)));
    backend.plan("last", Plan::Succeed(Duration::from_millis(300)));
    let controller = controller(tmp.path(), &backend, 2, Duration::from_secs(30));

    let report = controller
        .run(batch(&["long", "short", "last"]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 3);
    assert_eq!(backend.dispatched_names(), ["long", "short", "last"]);
    assert!(backend.dispatched_at("last") >= backend.finished_at("short"));
    assert!(backend.dispatched_at("last") < backend.finished_at("long"));
}

#[tokio::test(start_paused = true)]
async fn test_three_jobs_two_slots_one_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.plan("a", Plan::Succeed(Duration::from_secs(1)));
    backend.plan("b", Plan::Fail(Duration::from_secs(2)));
    backend.plan("c", Plan::Succeed(Duration::from_secs(2)));
    let controller = controller(tmp.path(), &backend, 2, Duration::from_secs(30));

    let jobs = batch(&["a", "b", "c"]);
    let keys: Vec<_> = jobs
        .jobs()
        .iter()
        .map(|job| controller.store().key(job))
        .collect();
    let report = controller.run(jobs, RunOptions::default()).await.unwrap();

    assert!(!report.success());
    assert!(report.ran_any());
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert!(backend.dispatched_at("c") >= backend.finished_at("a"));
    assert!(backend.dispatched_at("c") < backend.finished_at("b"));

    let committed: Vec<bool> = keys.iter().map(|k| controller.store().exists(k)).collect();
    assert_eq!(committed, [true, false, true]);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_cancels_within_one_poll_interval() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.plan("stuck", Plan::Hang);
    let timeout = Duration::from_secs(1);
    let controller = controller(tmp.path(), &backend, 2, timeout);

    let report = controller
        .run(batch(&["stuck"]), RunOptions::default())
        .await
        .unwrap();

    assert!(!report.success());
    match &report.records()[0].outcome {
        JobOutcome::TimedOut { elapsed, .. } => {
            assert!(*elapsed > timeout);
            assert!(*elapsed <= timeout + POLL);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert_eq!(*backend.cancelled.lock().unwrap(), ["stuck"]);

    let stuck = batch(&["stuck"]);
    let key = controller.store().key(&stuck.jobs()[0]);
    assert!(!controller.store().exists(&key));
}

#[tokio::test(start_paused = true)]
async fn test_unfetchable_job_still_times_out() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.plan("lost", Plan::FetchUnavailable);
    let timeout = Duration::from_secs(1);
    let controller = controller(tmp.path(), &backend, 1, timeout);

    let report = tokio::time::timeout(
        Duration::from_secs(60),
        controller.run(batch(&["lost"]), RunOptions::default()),
    )
    .await
    .expect("run did not finish")
    .unwrap();

    match &report.records()[0].outcome {
        JobOutcome::TimedOut { elapsed, .. } => {
            assert!(*elapsed > timeout);
            assert!(*elapsed <= timeout + POLL);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert_eq!(*backend.cancelled.lock().unwrap(), ["lost"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_cancel_still_frees_the_slot() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.plan("stuck", Plan::Uncancellable);
    backend.plan("next", Plan::Succeed(Duration::from_millis(300)));
    let timeout = Duration::from_secs(1);
    let controller = controller(tmp.path(), &backend, 1, timeout);

    let report = controller
        .run(batch(&["stuck", "next"]), RunOptions::default())
        .await
        .unwrap();

    let outcomes: HashMap<&str, &JobOutcome> = report
        .records()
        .iter()
        .map(|r| (r.label.as_str(), &r.outcome))
        .collect();
    assert!(matches!(outcomes["stuck/dc"], JobOutcome::TimedOut { .. }));
    assert!(matches!(outcomes["next/dc"], JobOutcome::Succeeded));
    assert_eq!(backend.dispatched_names(), ["stuck", "next"]);
    assert!(backend.dispatched_at("next") - backend.dispatched_at("stuck") > timeout);
    assert_eq!(*backend.cancelled.lock().unwrap(), ["stuck"]);
}

#[tokio::test(start_paused = true)]
async fn test_nan_results_are_answered_from_store() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let controller = controller(tmp.path(), &backend, 1, Duration::from_secs(30));
    let device: Arc<dyn Device> = Arc::new(TestDevice {
        name: "nan".to_string(),
        payload: "card of nan".to_string(),
        timeout: None,
        nan: true,
    });
    let batch = || JobBatch::new().add(Arc::clone(&device), sweep("dc"));

    let first = controller.run(batch(), RunOptions::default()).await.unwrap();
    assert_eq!(first.succeeded(), 1);
    let second = controller.run(batch(), RunOptions::default()).await.unwrap();

    assert_eq!(second.cached(), 1);
    assert!(!second.ran_any());
    assert_eq!(backend.dispatched_names(), ["nan"]);
    let results = second
        .dataset(device.identity())
        .unwrap()
        .get(&batch().jobs()[0].sweep_dir_name())
        .unwrap();
    assert!(results.column("len").unwrap()[1].is_nan());
}

#[tokio::test(start_paused = true)]
async fn test_device_timeout_extends_global_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.plan("slow", Plan::Succeed(Duration::from_secs(3)));
    let controller = controller(tmp.path(), &backend, 1, Duration::from_secs(1));

    let device = TestDevice::with_timeout("slow", Duration::from_secs(5));
    let report = controller
        .run(JobBatch::new().add(device, sweep("dc")), RunOptions::default())
        .await
        .unwrap();

    assert!(report.success());
    assert!(backend.cancelled.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failure_is_isolated() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.plan("broken", Plan::Fail(Duration::from_millis(200)));
    let controller = controller(tmp.path(), &backend, 2, Duration::from_secs(30));

    let report = controller
        .run(batch(&["ok1", "broken", "ok2"]), RunOptions::default())
        .await
        .unwrap();

    assert!(!report.success());
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    let broken = report
        .records()
        .iter()
        .find(|r| r.label == "broken/dc")
        .unwrap();
    assert!(matches!(&broken.outcome, JobOutcome::Failed { reason, .. } if reason.contains("exit code 1")));
    assert!(report.dataset(TestDevice::new("ok1").identity()).is_some());
    assert!(report.dataset(TestDevice::new("broken").identity()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_second_run_is_answered_from_store() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let controller = controller(tmp.path(), &backend, 2, Duration::from_secs(30));

    let first = controller
        .run(batch(&["a", "b"]), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(first.succeeded(), 2);

    let second = controller
        .run(batch(&["a", "b"]), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(second.cached(), 2);
    assert!(!second.ran_any());
    assert_eq!(backend.dispatched_names().len(), 2);

    let identity = TestDevice::new("a").identity();
    assert_eq!(first.dataset(identity), second.dataset(identity));
}

#[tokio::test(start_paused = true)]
async fn test_rerun_only_dispatches_new_jobs() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let first = controller(tmp.path(), &backend, 2, Duration::from_secs(30));

    first
        .run(batch(&["a"]), RunOptions::default())
        .await
        .unwrap();
    let second = first
        .run(batch(&["a", "b"]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(second.cached(), 1);
    assert_eq!(second.succeeded(), 1);
    assert_eq!(backend.dispatched_names(), ["a", "b"]);

    let fresh_backend = ScriptedBackend::new();
    let fresh = tempfile::tempdir().unwrap();
    let once = controller(fresh.path(), &fresh_backend, 2, Duration::from_secs(30))
        .run(batch(&["a", "b"]), RunOptions::default())
        .await
        .unwrap();
    for name in ["a", "b"] {
        let identity = TestDevice::new(name).identity();
        assert_eq!(second.dataset(identity), once.dataset(identity));
    }
}

#[tokio::test(start_paused = true)]
async fn test_force_runs_cached_jobs_again() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let controller = controller(tmp.path(), &backend, 2, Duration::from_secs(30));

    controller
        .run(batch(&["a"]), RunOptions::default())
        .await
        .unwrap();
    let forced = controller
        .run(batch(&["a"]), RunOptions::default().force(true))
        .await
        .unwrap();

    assert_eq!(forced.succeeded(), 1);
    assert_eq!(backend.dispatched_names(), ["a", "a"]);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_jobs_run_once() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let controller = controller(tmp.path(), &backend, 4, Duration::from_secs(30));

    let report = controller
        .run(batch(&["a", "a", "b"]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.records().len(), 2);
    assert_eq!(backend.dispatched_names(), ["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_uncommitted_directory_is_rerun() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let controller = controller(tmp.path(), &backend, 2, Duration::from_secs(30));

    let batch = batch(&["a"]);
    let store = controller.store();
    let key = store.key(&batch.jobs()[0]);
    let dir = store.materialize(&key).unwrap();
    std::fs::write(dir.join("output.dat"), "leftover").unwrap();

    let report = controller.run(batch, RunOptions::default()).await.unwrap();
    assert_eq!(report.succeeded(), 1);
    assert_eq!(backend.dispatched_names(), ["a"]);
    assert!(store.exists(&key));
}

#[tokio::test(start_paused = true)]
async fn test_transient_poll_errors_are_retried() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.plan(
        "flaky",
        Plan::Flaky {
            transient_polls: 3,
            after: Duration::from_millis(200),
        },
    );
    let controller = controller(tmp.path(), &backend, 1, Duration::from_secs(30));

    let report = controller
        .run(batch(&["flaky"]), RunOptions::default())
        .await
        .unwrap();
    assert!(report.success());
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_aborts_run() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.plan("running", Plan::Hang);
    backend.plan("unreachable", Plan::TransportOnDispatch);
    let controller = controller(tmp.path(), &backend, 2, Duration::from_secs(30));

    let err = controller
        .run(batch(&["running", "unreachable"]), RunOptions::default())
        .await
        .unwrap_err();

    assert!(err.is_transport());
    assert_eq!(*backend.cancelled.lock().unwrap(), ["running"]);
    assert_eq!(backend.running.load(Ordering::SeqCst), 0);
    assert_eq!(backend.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remove_results_deletes_job_directories() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let controller = controller(tmp.path(), &backend, 2, Duration::from_secs(30));

    let report = controller
        .run(
            batch(&["a", "b"]),
            RunOptions::default().remove_results(true),
        )
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 2);
    for record in report.records() {
        assert!(!record.workdir.exists());
    }
}

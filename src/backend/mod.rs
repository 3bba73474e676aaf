//! Execution backends for simcon.
//!
//! This module defines the `Backend` trait and its three implementations:
//! local child processes, a remote interactive shell and a remote batch queue.
//!
//! The controller drives every backend through the same four calls:
//! `dispatch` once, `poll` every cycle until the job is terminal, `fetch` on
//! success and `cancel` on timeout. None of them may block for long; remote
//! calls are bounded by the transport's command timeout.

pub mod batch;
pub mod local;
pub mod remote;
pub mod session;
pub mod transport;

use crate::error::{Result, SimconError};
use crate::job::{BackendKind, Job, StartCommand};
use local::LocalHandle;
use remote::RemoteHandle;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for boxed async futures.
///
/// Used to enable dynamic dispatch for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Answer of a non-blocking poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Still queued or running.
    Pending,
    /// The process finished and reported success.
    Succeeded,
    /// The process finished and reported failure.
    Failed {
        /// Human-readable reason.
        reason: String,
    },
}

/// Where a job lives, locally and relative to any simulation root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    /// Local simulation root.
    pub local_root: PathBuf,
    /// `<device-dir>/<sweep-dir>`, identical on every host.
    pub relative: PathBuf,
}

impl JobPaths {
    /// Creates job paths.
    #[must_use]
    pub fn new(local_root: impl Into<PathBuf>, relative: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            relative: relative.into(),
        }
    }

    /// Local job directory.
    #[must_use]
    pub fn workdir(&self) -> PathBuf {
        self.local_root.join(&self.relative)
    }

    /// Device directory name (first component of the relative path).
    #[must_use]
    pub fn device_dir(&self) -> &Path {
        self.relative.parent().unwrap_or_else(|| Path::new(""))
    }

    /// Sweep directory name (last component of the relative path).
    #[must_use]
    pub fn sweep_dir(&self) -> String {
        self.relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Backend-specific state of one dispatched job.
#[derive(Debug)]
pub enum JobHandle {
    /// Local child process.
    Local(LocalHandle),
    /// Remote job, interactive or batch.
    Remote(RemoteHandle),
    /// Job of a backend defined outside this crate, which keeps its own
    /// state keyed by this id.
    External(u64),
}

impl JobHandle {
    /// Short description for log lines (pid or batch id).
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Local(h) => h
                .pid()
                .map_or_else(|| "local".to_string(), |pid| format!("pid {pid}")),
            Self::Remote(h) => h.describe(),
            Self::External(id) => format!("job #{id}"),
        }
    }
}

/// Trait for running simulation jobs on one kind of backend.
///
/// # Errors
///
/// Implementations report per-job problems as `SimulationFailed` or
/// `InvalidJob`, a lost connection during `dispatch` as `Transport`, and any
/// problem answering `poll` or `fetch` this cycle as `TransientPoll`.
pub trait Backend: Send + Sync {
    /// Backend kind served.
    fn kind(&self) -> BackendKind;

    /// Human-readable name.
    fn name(&self) -> &'static str;

    /// Starts `job` whose inputs are already prepared in `paths.workdir()`.
    fn dispatch<'a>(&'a self, job: &'a Job, paths: &'a JobPaths)
        -> BoxFuture<'a, Result<JobHandle>>;

    /// Checks, without blocking, whether the job finished.
    fn poll<'a>(&'a self, handle: &'a mut JobHandle) -> BoxFuture<'a, Result<PollStatus>>;

    /// Brings the job artifacts into the local job directory.
    fn fetch<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, Result<()>>;

    /// Stops a running job.
    fn cancel<'a>(&'a self, handle: &'a mut JobHandle) -> BoxFuture<'a, Result<()>>;

    /// Releases what the backend holds for a job that left the running set.
    fn retire(&self, _handle: JobHandle) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    /// Releases shared resources at the end of a controller run.
    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Backends indexed by the kind they serve.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl BackendSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend under its kind, replacing any previous one.
    pub fn insert(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.kind(), backend);
    }

    /// Returns the backend for `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if no backend of that kind is registered.
    pub fn get(&self, kind: BackendKind) -> Result<&Arc<dyn Backend>> {
        self.backends.get(&kind).ok_or_else(|| SimconError::InvalidJob {
            reason: format!("no {kind} backend configured"),
        })
    }

    /// Returns true if a backend of `kind` is registered.
    #[must_use]
    pub fn contains(&self, kind: BackendKind) -> bool {
        self.backends.contains_key(&kind)
    }

    /// Iterates over all registered backends.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.backends.values()
    }
}

/// Returns true if `code` is one of `accepted`.
pub(crate) fn exit_code_accepted(accepted: &[i32], code: i32) -> bool {
    accepted.contains(&code)
}

/// First lines of every `sim.log`.
pub(crate) fn log_header(command: &StartCommand) -> String {
    format!("The simulation command is\n{command}\n\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // Test that Backend trait is object-safe (can be used with dyn)
    #[allow(dead_code)]
    fn _assert_object_safe(_backend: &dyn Backend) {}

    #[test]
    fn test_job_paths() {
        let paths = JobPaths::new("/sim", "npnabc/gummel_def");
        assert_eq!(paths.workdir(), PathBuf::from("/sim/npnabc/gummel_def"));
        assert_eq!(paths.device_dir(), Path::new("npnabc"));
        assert_eq!(paths.sweep_dir(), "gummel_def");
    }

    #[test]
    fn test_log_header() {
        let command = StartCommand::new("ngspice", ["-b", "netlist.cir"]);
        assert_eq!(
            log_header(&command),
            "The simulation command is\nngspice -b netlist.cir\n\n"
        );
    }

    #[test]
    fn test_backend_set_lookup() {
        let mut set = BackendSet::new();
        assert!(set.get(BackendKind::Local).is_err());

        set.insert(Arc::new(local::LocalBackend::new()));
        assert!(set.contains(BackendKind::Local));
        assert_eq!(set.get(BackendKind::Local).unwrap().name(), "local");
        assert!(!set.contains(BackendKind::RemoteBatch));
    }
}

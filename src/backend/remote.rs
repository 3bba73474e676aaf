//! Remote interactive backend.
//!
//! Starts the simulator as a detached background process over the remote
//! session. The wrapper shell appends a sentinel line with the exit code to
//! `sim.log` when the simulator ends, which is what `poll` looks for.

use crate::backend::session::RemoteSession;
use crate::backend::{
    exit_code_accepted, log_header, Backend, BoxFuture, JobHandle, JobPaths, PollStatus,
};
use crate::error::{Result, SimconError};
use crate::job::{sh_quote, BackendKind, Job, StartCommand};
use crate::store::LOG_FILE_NAME;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix of the line appended to `sim.log` when the simulator exits.
pub const EXIT_SENTINEL: &str = "__SIMCON_EXIT__";

const ALIVE_MARKER: &str = "__SIMCON_ALIVE__";

/// Identifier of a remote job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteJobId {
    /// Process id of the wrapper shell on the remote host.
    Pid(u32),
    /// Job id assigned by the batch scheduler.
    Queue(String),
}

/// Running remote job.
#[derive(Debug)]
pub struct RemoteHandle {
    label: String,
    paths: JobPaths,
    remote_dir: String,
    id: RemoteJobId,
    polls: u32,
}

impl RemoteHandle {
    pub(crate) fn new(job: &Job, paths: &JobPaths, remote_dir: String, id: RemoteJobId) -> Self {
        Self {
            label: job.label(),
            paths: paths.clone(),
            remote_dir,
            id,
            polls: 0,
        }
    }

    /// Returns the remote job id.
    #[must_use]
    pub const fn id(&self) -> &RemoteJobId {
        &self.id
    }

    /// Returns the job directory on the remote host.
    #[must_use]
    pub fn remote_dir(&self) -> &str {
        &self.remote_dir
    }

    /// Returns the local job paths.
    #[must_use]
    pub const fn paths(&self) -> &JobPaths {
        &self.paths
    }

    /// Short description for log lines.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.id {
            RemoteJobId::Pid(pid) => format!("{} (remote pid {pid})", self.label),
            RemoteJobId::Queue(id) => format!("{} (batch job {id})", self.label),
        }
    }

    /// Counts a poll cycle; returns true on every `every`-th cycle.
    pub(crate) fn tick(&mut self, every: u32) -> bool {
        self.polls = self.polls.wrapping_add(1);
        self.polls % every.max(1) == 0
    }
}

pub(crate) fn remote_handle(handle: &JobHandle) -> Result<&RemoteHandle> {
    match handle {
        JobHandle::Remote(h) => Ok(h),
        other => Err(SimconError::InvalidJob {
            reason: format!("{} passed to remote backend", other.describe()),
        }),
    }
}

pub(crate) fn remote_handle_mut(handle: &mut JobHandle) -> Result<&mut RemoteHandle> {
    match handle {
        JobHandle::Remote(h) => Ok(h),
        other => Err(SimconError::InvalidJob {
            reason: format!("{} passed to remote backend", other.describe()),
        }),
    }
}

/// Maps connection problems while polling or fetching to a transient error,
/// so one bad cycle does not fail the job.
pub(crate) fn transient(e: SimconError) -> SimconError {
    match e {
        SimconError::Transport { host, message } => SimconError::TransientPoll {
            message: format!("{host}: {message}"),
        },
        other => other,
    }
}

/// Writes the log header into the local job directory so it travels with
/// the upload.
pub(crate) fn write_log_header(paths: &JobPaths, command: &StartCommand) -> Result<()> {
    std::fs::write(paths.workdir().join(LOG_FILE_NAME), log_header(command))?;
    Ok(())
}

/// Backend that runs jobs as background processes on a remote host.
pub struct RemoteInteractiveBackend {
    session: Arc<RemoteSession>,
    accepted_exit_codes: Vec<i32>,
    poll_every: u32,
}

impl RemoteInteractiveBackend {
    /// Creates a backend on `session`, polling the host every cycle.
    #[must_use]
    pub fn new(session: Arc<RemoteSession>) -> Self {
        Self {
            session,
            accepted_exit_codes: vec![0],
            poll_every: 1,
        }
    }

    /// Sets the exit codes treated as success.
    #[must_use]
    pub fn with_accepted_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.accepted_exit_codes = codes;
        self
    }

    /// Only contacts the host on every `every`-th poll cycle.
    #[must_use]
    pub fn with_poll_every(mut self, every: u32) -> Self {
        self.poll_every = every.max(1);
        self
    }

    fn launch_command(remote_dir: &str, command: &StartCommand) -> String {
        let wrapped = format!(
            "{} >> {LOG_FILE_NAME} 2>&1; echo \"{EXIT_SENTINEL} $?\" >> {LOG_FILE_NAME}",
            command.to_shell()
        );
        format!(
            "cd {} || exit 1; nohup sh -c {} > /dev/null 2>&1 & echo $!",
            sh_quote(remote_dir),
            sh_quote(&wrapped)
        )
    }

    fn status_command(remote_dir: &str, pid: u32) -> String {
        format!(
            "if kill -0 {pid} 2>/dev/null; then echo {ALIVE_MARKER}; fi; tail -n 5 {}/{LOG_FILE_NAME} 2>/dev/null",
            sh_quote(remote_dir)
        )
    }

    async fn start(&self, job: &Job, paths: &JobPaths) -> Result<JobHandle> {
        let command = job.device().start_command();
        write_log_header(paths, &command)?;
        self.session.upload_dir(paths).await?;

        let remote_dir = self.session.remote_dir(&paths.relative);
        let output = self
            .session
            .exec_checked(&Self::launch_command(&remote_dir, &command))
            .await?;
        let pid = output
            .stdout
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<u32>().ok())
            .ok_or_else(|| SimconError::SimulationFailed {
                reason: format!("could not read remote pid from {:?}", output.stdout),
            })?;

        let handle = RemoteHandle::new(job, paths, remote_dir, RemoteJobId::Pid(pid));
        info!("Started {}", handle.describe());
        Ok(JobHandle::Remote(handle))
    }

    fn interpret(&self, stdout: &str) -> PollStatus {
        let exit = stdout.lines().rev().find_map(|line| {
            line.trim()
                .strip_prefix(EXIT_SENTINEL)
                .and_then(|code| code.trim().parse::<i32>().ok())
        });
        match exit {
            Some(code) if exit_code_accepted(&self.accepted_exit_codes, code) => {
                PollStatus::Succeeded
            }
            Some(code) => PollStatus::Failed {
                reason: format!("remote process exited with code {code}"),
            },
            None if stdout.lines().any(|l| l.trim() == ALIVE_MARKER) => PollStatus::Pending,
            None => PollStatus::Failed {
                reason: "remote process vanished without an exit status".to_string(),
            },
        }
    }
}

impl Backend for RemoteInteractiveBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteInteractive
    }

    fn name(&self) -> &'static str {
        "remote-interactive"
    }

    fn dispatch<'a>(
        &'a self,
        job: &'a Job,
        paths: &'a JobPaths,
    ) -> BoxFuture<'a, Result<JobHandle>> {
        Box::pin(async move {
            self.session.acquire().await?;
            let started = self.start(job, paths).await;
            if started.is_err() {
                self.session.release().await;
            }
            started
        })
    }

    fn poll<'a>(&'a self, handle: &'a mut JobHandle) -> BoxFuture<'a, Result<PollStatus>> {
        Box::pin(async move {
            let handle = remote_handle_mut(handle)?;
            if !handle.tick(self.poll_every) {
                return Ok(PollStatus::Pending);
            }
            let RemoteJobId::Pid(pid) = handle.id else {
                return Err(SimconError::InvalidJob {
                    reason: format!("{} is not an interactive job", handle.describe()),
                });
            };

            let output = self
                .session
                .exec(&Self::status_command(&handle.remote_dir, pid))
                .await
                .map_err(transient)?;
            let status = self.interpret(&output.stdout);
            debug!("{}: {status:?}", handle.describe());
            Ok(status)
        })
    }

    fn fetch<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let handle = remote_handle(handle)?;
            self.session
                .fetch_dir(&handle.paths)
                .await
                .map_err(transient)
        })
    }

    fn cancel<'a>(&'a self, handle: &'a mut JobHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let handle = remote_handle_mut(handle)?;
            let RemoteJobId::Pid(pid) = handle.id else {
                return Err(SimconError::InvalidJob {
                    reason: format!("{} is not an interactive job", handle.describe()),
                });
            };
            self.session
                .exec(&format!("pkill -P {pid} 2>/dev/null; kill {pid} 2>/dev/null; true"))
                .await?;
            warn!("Killed {}", handle.describe());
            Ok(())
        })
    }

    fn retire(&self, _handle: JobHandle) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.session.release().await })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.session.shutdown().await })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::transport::tests::ShellTransport;
    use crate::hash::{fingerprint, Digest};
    use crate::job::{Device, ResultSet};
    use crate::sweep::Sweep;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    pub(crate) struct ScriptDevice {
        pub script: String,
        pub kind: BackendKind,
    }

    impl Device for ScriptDevice {
        fn name(&self) -> &str {
            "script"
        }

        fn identity(&self) -> Digest {
            fingerprint([self.script.as_str()])
        }

        fn prepare(&self, _sweep: &Sweep, workdir: &Path) -> Result<()> {
            std::fs::write(workdir.join("input.txt"), "1 2 3")?;
            Ok(())
        }

        fn start_command(&self) -> StartCommand {
            StartCommand::new("sh", ["-c", self.script.as_str()])
        }

        fn backend_kind(&self) -> BackendKind {
            self.kind
        }

        fn validate(&self, _sweep: &Sweep, _workdir: &Path) -> Result<()> {
            Ok(())
        }

        fn parse_results(&self, _sweep: &Sweep, _workdir: &Path) -> Result<ResultSet> {
            Ok(ResultSet::new())
        }
    }

    pub(crate) fn setup(
        script: &str,
        kind: BackendKind,
    ) -> (
        tempfile::TempDir,
        tempfile::TempDir,
        Arc<ShellTransport>,
        Arc<RemoteSession>,
        Job,
        JobPaths,
    ) {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let transport = Arc::new(ShellTransport::new());
        let session = Arc::new(RemoteSession::new(
            transport.clone(),
            remote.path().join("sims").display().to_string(),
        ));

        let device = Arc::new(ScriptDevice {
            script: script.to_string(),
            kind,
        });
        let sweep = Arc::new(Sweep::builder("dc").constant("V", 1.0).build().unwrap());
        let job = Job::new(device, sweep);

        let paths = JobPaths::new(
            local.path(),
            Path::new(&job.device_dir_name()).join(job.sweep_dir_name()),
        );
        std::fs::create_dir_all(paths.workdir()).unwrap();
        job.device().prepare(job.sweep(), &paths.workdir()).unwrap();
        (local, remote, transport, session, job, paths)
    }

    async fn wait(backend: &dyn Backend, handle: &mut JobHandle) -> PollStatus {
        for _ in 0..500 {
            let status = backend.poll(handle).await.unwrap();
            if status != PollStatus::Pending {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("remote job did not finish");
    }

    #[test]
    fn test_interpret_sentinel() {
        let transport = Arc::new(ShellTransport::new());
        let session = Arc::new(RemoteSession::new(transport, "/tmp/x"));
        let backend = RemoteInteractiveBackend::new(session).with_accepted_exit_codes(vec![0, 3]);

        assert_eq!(
            backend.interpret(&format!("{ALIVE_MARKER}\nstep 1\n")),
            PollStatus::Pending
        );
        assert_eq!(
            backend.interpret(&format!("done\n{EXIT_SENTINEL} 0\n")),
            PollStatus::Succeeded
        );
        assert_eq!(
            backend.interpret(&format!("{EXIT_SENTINEL} 3\n")),
            PollStatus::Succeeded
        );
        assert!(matches!(
            backend.interpret(&format!("{EXIT_SENTINEL} 1\n")),
            PollStatus::Failed { .. }
        ));
        assert!(matches!(backend.interpret(""), PollStatus::Failed { .. }));
    }

    #[test]
    fn test_tick_throttles() {
        let (_l, _r, _t, _s, job, paths) = setup("true", BackendKind::RemoteInteractive);
        let mut handle = RemoteHandle::new(&job, &paths, "/x".into(), RemoteJobId::Pid(1));
        let ticks: Vec<bool> = (0..10).map(|_| handle.tick(5)).collect();
        assert_eq!(ticks.iter().filter(|t| **t).count(), 2);
        assert!(ticks[4] && ticks[9]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remote_interactive_lifecycle() {
        let (_local, _remote, transport, session, job, paths) =
            setup("cat input.txt > output.dat", BackendKind::RemoteInteractive);
        let backend = RemoteInteractiveBackend::new(session.clone());

        let mut handle = backend.dispatch(&job, &paths).await.unwrap();
        assert!(session.is_connected().await);
        assert_eq!(wait(&backend, &mut handle).await, PollStatus::Succeeded);

        backend.fetch(&handle).await.unwrap();
        let output = std::fs::read_to_string(paths.workdir().join("output.dat")).unwrap();
        assert_eq!(output, "1 2 3");
        let log = std::fs::read_to_string(paths.workdir().join(LOG_FILE_NAME)).unwrap();
        assert!(log.starts_with("The simulation command is"));

        backend.retire(handle).await;
        assert!(!session.is_connected().await);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remote_interactive_failure_exit_code() {
        let (_local, _remote, _transport, session, job, paths) =
            setup("exit 7", BackendKind::RemoteInteractive);
        let backend = RemoteInteractiveBackend::new(session);

        let mut handle = backend.dispatch(&job, &paths).await.unwrap();
        match wait(&backend, &mut handle).await {
            PollStatus::Failed { reason } => assert!(reason.contains('7')),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remote_poll_transport_error_is_transient() {
        let (_local, _remote, transport, session, job, paths) =
            setup("sleep 5", BackendKind::RemoteInteractive);
        let backend = RemoteInteractiveBackend::new(session);

        let mut handle = backend.dispatch(&job, &paths).await.unwrap();
        transport.fail_exec.store(true, Ordering::SeqCst);
        let err = backend.poll(&mut handle).await.unwrap_err();
        assert!(err.is_transient());

        transport.fail_exec.store(false, Ordering::SeqCst);
        assert_eq!(backend.poll(&mut handle).await.unwrap(), PollStatus::Pending);
        backend.cancel(&mut handle).await.unwrap();
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_connect_failure() {
        let (_local, _remote, transport, session, job, paths) =
            setup("true", BackendKind::RemoteInteractive);
        transport.fail_connect.store(true, Ordering::SeqCst);
        let backend = RemoteInteractiveBackend::new(session);

        let err = backend.dispatch(&job, &paths).await.unwrap_err();
        assert!(err.is_transport());
    }
}

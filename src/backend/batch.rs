//! Remote batch-queue backend.
//!
//! Writes a job script next to the simulator inputs, submits it with the
//! configured submit command (`qsub` by default) and asks the status command
//! (`qstat`) about it. Schedulers forget finished jobs, so a job the status
//! command no longer knows is treated as finished; whether it actually produced
//! results is decided by the device's validation after fetch.

use crate::backend::remote::{
    remote_handle, remote_handle_mut, transient, write_log_header, RemoteHandle, RemoteJobId,
};
use crate::backend::session::RemoteSession;
use crate::backend::{Backend, BoxFuture, JobHandle, JobPaths, PollStatus};
use crate::error::{Result, SimconError};
use crate::job::{sh_quote, BackendKind, Job, StartCommand};
use crate::store::LOG_FILE_NAME;
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the generated job script.
pub const JOB_SCRIPT_NAME: &str = "job.sh";

/// Scheduler commands used by [`RemoteBatchBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCommands {
    /// Command that takes a script path and prints the job id.
    pub submit: String,
    /// Command that takes a job id and prints its status.
    pub status: String,
}

impl Default for BatchCommands {
    fn default() -> Self {
        Self {
            submit: "qsub".to_string(),
            status: "qstat".to_string(),
        }
    }
}

/// Extracts the job id from the submit command output.
///
/// The id is the first run of digits before the first `.` on the first
/// non-empty line, which covers `12345.headnode` as well as
/// `Submitted batch job 12345`.
#[must_use]
pub fn parse_job_id(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let head = line.split('.').next()?;
    let start = head.find(|c: char| c.is_ascii_digit())?;
    let id: String = head[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    Some(id)
}

/// Returns true if the status command output says the job left the queue.
#[must_use]
pub fn job_finished(stdout: &str, stderr: &str) -> bool {
    let combined = format!("{stdout}{stderr}");
    combined.trim().is_empty() || combined.to_ascii_lowercase().contains("unknown job")
}

/// Backend that submits jobs to a remote batch scheduler.
pub struct RemoteBatchBackend {
    session: Arc<RemoteSession>,
    commands: BatchCommands,
    poll_every: u32,
}

impl RemoteBatchBackend {
    /// Creates a backend on `session` with `qsub`/`qstat`.
    #[must_use]
    pub fn new(session: Arc<RemoteSession>) -> Self {
        Self {
            session,
            commands: BatchCommands::default(),
            poll_every: 1,
        }
    }

    /// Sets the scheduler commands.
    #[must_use]
    pub fn with_commands(mut self, commands: BatchCommands) -> Self {
        self.commands = commands;
        self
    }

    /// Only contacts the scheduler on every `every`-th poll cycle.
    #[must_use]
    pub fn with_poll_every(mut self, every: u32) -> Self {
        self.poll_every = every.max(1);
        self
    }

    fn job_script(remote_dir: &str, command: &StartCommand) -> String {
        format!(
            "#!/bin/sh\ncd {}\n{} >> {LOG_FILE_NAME} 2>&1\n",
            sh_quote(remote_dir),
            command.to_shell()
        )
    }

    async fn submit(&self, job: &Job, paths: &JobPaths) -> Result<JobHandle> {
        let command = job.device().start_command();
        let remote_dir = self.session.remote_dir(&paths.relative);

        write_log_header(paths, &command)?;
        std::fs::write(
            paths.workdir().join(JOB_SCRIPT_NAME),
            Self::job_script(&remote_dir, &command),
        )?;
        self.session.upload_dir(paths).await?;

        let submit = format!(
            "cd {} && {} {JOB_SCRIPT_NAME}",
            sh_quote(&remote_dir),
            self.commands.submit
        );
        let output = self.session.exec_checked(&submit).await?;
        let id = parse_job_id(&output.stdout).ok_or_else(|| SimconError::SimulationFailed {
            reason: format!(
                "could not read batch job id from {:?}",
                output.stdout.trim()
            ),
        })?;

        let handle = RemoteHandle::new(job, paths, remote_dir, RemoteJobId::Queue(id));
        info!("Submitted {}", handle.describe());
        Ok(JobHandle::Remote(handle))
    }
}

impl Backend for RemoteBatchBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteBatch
    }

    fn name(&self) -> &'static str {
        "remote-batch"
    }

    fn dispatch<'a>(
        &'a self,
        job: &'a Job,
        paths: &'a JobPaths,
    ) -> BoxFuture<'a, Result<JobHandle>> {
        Box::pin(async move {
            self.session.acquire().await?;
            let submitted = self.submit(job, paths).await;
            if submitted.is_err() {
                self.session.release().await;
            }
            submitted
        })
    }

    fn poll<'a>(&'a self, handle: &'a mut JobHandle) -> BoxFuture<'a, Result<PollStatus>> {
        Box::pin(async move {
            let handle = remote_handle_mut(handle)?;
            if !handle.tick(self.poll_every) {
                return Ok(PollStatus::Pending);
            }
            let RemoteJobId::Queue(id) = handle.id() else {
                return Err(SimconError::InvalidJob {
                    reason: format!("{} is not a batch job", handle.describe()),
                });
            };

            let status = format!("{} {id}", self.commands.status);
            let output = self.session.exec(&status).await.map_err(transient)?;
            if job_finished(&output.stdout, &output.stderr) {
                debug!("{} left the queue", handle.describe());
                Ok(PollStatus::Succeeded)
            } else if output.success() {
                Ok(PollStatus::Pending)
            } else {
                Err(SimconError::TransientPoll {
                    message: format!(
                        "{} exited with {}: {}",
                        self.commands.status,
                        output.exit_code,
                        output.stderr.trim()
                    ),
                })
            }
        })
    }

    fn fetch<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let handle = remote_handle(handle)?;
            self.session
                .fetch_dir(handle.paths())
                .await
                .map_err(transient)
        })
    }

    fn cancel<'a>(&'a self, _handle: &'a mut JobHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async {
            Err(SimconError::Unsupported {
                backend: "remote-batch",
                operation: "cancel",
            })
        })
    }

    fn retire(&self, _handle: JobHandle) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.session.release().await })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.session.shutdown().await })
    }
}

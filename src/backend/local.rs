//! Local execution backend.
//!
//! Runs the simulator as a child process inside the job directory, with
//! stdout and stderr both redirected into `sim.log`.

use crate::backend::{
    exit_code_accepted, log_header, Backend, BoxFuture, JobHandle, JobPaths, PollStatus,
};
use crate::error::{Result, SimconError};
use crate::job::{BackendKind, Job, StartCommand};
use crate::store::LOG_FILE_NAME;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Running local child process.
#[derive(Debug)]
pub struct LocalHandle {
    child: Child,
    pid: Option<u32>,
}

impl LocalHandle {
    /// Returns the OS process id, if the process was still alive at spawn time.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Backend that runs jobs as local processes.
///
/// # Example
///
/// ```
/// use simcon::backend::local::LocalBackend;
/// use simcon::backend::Backend;
///
/// let backend = LocalBackend::new();
/// assert_eq!(backend.name(), "local");
/// ```
pub struct LocalBackend {
    /// Exit codes treated as process-level success.
    accepted_exit_codes: Vec<i32>,
}

impl LocalBackend {
    /// Creates a local backend accepting only exit code 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_accepted_exit_codes(vec![0])
    }

    /// Creates a local backend with a custom set of successful exit codes.
    ///
    /// Some simulators crash on shutdown after writing complete output; their
    /// results are still checked by `Device::validate`.
    #[must_use]
    pub fn with_accepted_exit_codes(accepted_exit_codes: Vec<i32>) -> Self {
        info!("LocalBackend initialized, accepted exit codes {accepted_exit_codes:?}");
        Self {
            accepted_exit_codes,
        }
    }

    /// Validates that an explicit binary path exists and is executable.
    ///
    /// Bare program names are resolved through `PATH` at spawn time.
    fn validate_binary(program: &str) -> Result<()> {
        if !program.contains('/') {
            return Ok(());
        }
        let path = Path::new(program);
        if !path.exists() {
            return Err(SimconError::InvalidJob {
                reason: format!("binary not found: {program}"),
            });
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = path.metadata()?.permissions();
            if permissions.mode() & 0o111 == 0 {
                return Err(SimconError::InvalidJob {
                    reason: format!("binary is not executable: {program}"),
                });
            }
        }

        Ok(())
    }

    fn spawn(command: &StartCommand, workdir: &Path) -> Result<LocalHandle> {
        Self::validate_binary(&command.program)?;

        let mut log = File::create(workdir.join(LOG_FILE_NAME))?;
        log.write_all(log_header(command).as_bytes())?;
        let log_err = log.try_clone()?;

        let child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", command.program);
                SimconError::SimulationFailed {
                    reason: format!("failed to spawn {}: {e}", command.program),
                }
            })?;

        let pid = child.id();
        Ok(LocalHandle { child, pid })
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn local_handle(handle: &mut JobHandle) -> Result<&mut LocalHandle> {
    match handle {
        JobHandle::Local(h) => Ok(h),
        other => Err(SimconError::InvalidJob {
            reason: format!("{} passed to local backend", other.describe()),
        }),
    }
}

impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn name(&self) -> &'static str {
        "local"
    }

    fn dispatch<'a>(
        &'a self,
        job: &'a Job,
        paths: &'a JobPaths,
    ) -> BoxFuture<'a, Result<JobHandle>> {
        Box::pin(async move {
            let command = job.device().start_command();
            let workdir = paths.workdir();
            debug!("Starting {} in {}: {command}", job.label(), workdir.display());

            let handle = Self::spawn(&command, &workdir)?;
            info!(
                "Started local simulation {} (pid {:?})",
                job.label(),
                handle.pid
            );
            Ok(JobHandle::Local(handle))
        })
    }

    fn poll<'a>(&'a self, handle: &'a mut JobHandle) -> BoxFuture<'a, Result<PollStatus>> {
        Box::pin(async move {
            let handle = local_handle(handle)?;
            let status = handle
                .child
                .try_wait()
                .map_err(|e| SimconError::TransientPoll {
                    message: format!("failed to query pid {:?}: {e}", handle.pid),
                })?;

            let Some(status) = status else {
                return Ok(PollStatus::Pending);
            };

            Ok(match status.code() {
                Some(code) if exit_code_accepted(&self.accepted_exit_codes, code) => {
                    debug!("pid {:?} exited with accepted code {code}", handle.pid);
                    PollStatus::Succeeded
                }
                Some(code) => PollStatus::Failed {
                    reason: format!("process exited with code {code}"),
                },
                None => PollStatus::Failed {
                    reason: "process terminated by signal".to_string(),
                },
            })
        })
    }

    fn fetch<'a>(&'a self, _handle: &'a JobHandle) -> BoxFuture<'a, Result<()>> {
        // Artifacts are written in place.
        Box::pin(async { Ok(()) })
    }

    fn cancel<'a>(&'a self, handle: &'a mut JobHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let handle = local_handle(handle)?;
            if let Err(e) = handle.child.start_kill() {
                // InvalidInput: the process already exited.
                if e.kind() != std::io::ErrorKind::InvalidInput {
                    warn!("Failed to kill pid {:?}: {e}", handle.pid);
                    return Err(SimconError::Io(e));
                }
            }
            // Reap if it is already gone; kill_on_drop covers the rest.
            if let Err(e) = handle.child.try_wait() {
                debug!("Reaping pid {:?} failed: {e}", handle.pid);
            }
            info!("Killed local simulation pid {:?}", handle.pid);
            Ok(())
        })
    }
}

//! Remote command and file transport.
//!
//! The remote backends never talk to the network directly; they go through
//! [`RemoteTransport`]. The production implementation shells out to the system
//! `ssh` and `scp` binaries and multiplexes every call over one OpenSSH control
//! master, so a session costs one authentication no matter how many jobs it
//! serves.

use crate::backend::BoxFuture;
use crate::error::{Result, SimconError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Exit status and captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Remote exit code (`-1` if the command was killed by a signal).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the command exited with code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Command execution and file copy on one remote host.
///
/// # Errors
///
/// `connect` reports an unreachable host as `Transport`. The other calls
/// report a broken connection as `Transport` and a call that ran into the
/// command timeout as `TransientPoll`.
pub trait RemoteTransport: Send + Sync {
    /// Host name, for log lines and errors.
    fn host(&self) -> &str;

    /// Opens the shared connection.
    fn connect(&self) -> BoxFuture<'_, Result<()>>;

    /// Runs `command` through the remote login shell.
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<CommandOutput>>;

    /// Copies a local file to a remote path.
    fn upload<'a>(&'a self, local: &'a Path, remote: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Copies a remote file to a local path.
    fn download<'a>(&'a self, remote: &'a str, local: &'a Path) -> BoxFuture<'a, Result<()>>;

    /// Closes the shared connection.
    fn disconnect(&self) -> BoxFuture<'_, Result<()>>;
}

/// Connection settings for [`SshTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    /// Remote host name or address.
    pub host: String,
    /// Login user; the ssh default when `None`.
    pub user: Option<String>,
    /// Port; the ssh default when `None`.
    pub port: Option<u16>,
    /// Private key file.
    pub identity_file: Option<PathBuf>,
    /// Control master socket path.
    pub control_path: PathBuf,
    /// Upper bound for every single ssh/scp invocation.
    pub command_timeout: Duration,
}

impl SshSettings {
    /// Creates settings for `host` with a control socket in the temp directory.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();
        let control_path =
            std::env::temp_dir().join(format!("simcon-{}-{}.ctl", host, std::process::id()));
        Self {
            host,
            user: None,
            port: None,
            identity_file: None,
            control_path,
            command_timeout: Duration::from_secs(60),
        }
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

/// [`RemoteTransport`] over the system OpenSSH client.
#[derive(Debug, Clone)]
pub struct SshTransport {
    settings: SshSettings,
}

impl SshTransport {
    /// Creates a transport. No connection is made until `connect`.
    #[must_use]
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    /// Returns the settings.
    #[must_use]
    pub const fn settings(&self) -> &SshSettings {
        &self.settings
    }

    fn configure(&self, cmd: &mut Command, scp_style: bool) {
        if let Some(port) = self.settings.port {
            cmd.arg(if scp_style { "-P" } else { "-p" })
                .arg(port.to_string());
        }
        if let Some(id) = &self.settings.identity_file {
            cmd.arg("-i").arg(id);
        }
        cmd.arg("-o")
            .arg(format!(
                "ControlPath={}",
                self.settings.control_path.display()
            ))
            .arg("-o")
            .arg("BatchMode=yes");
    }

    fn transport_error(&self, message: impl Into<String>) -> SimconError {
        SimconError::Transport {
            host: self.settings.host.clone(),
            message: message.into(),
        }
    }

    async fn run(&self, mut cmd: Command, what: &str) -> Result<CommandOutput> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.settings.command_timeout, cmd.output())
            .await
            .map_err(|_| SimconError::TransientPoll {
                message: format!(
                    "{what} on {} timed out after {:?}",
                    self.settings.host, self.settings.command_timeout
                ),
            })?
            .map_err(|e| self.transport_error(format!("failed to run {what}: {e}")))?;

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        // 255 is reserved by ssh and scp for connection-level failures.
        if result.exit_code == 255 {
            return Err(self.transport_error(format!("{what} failed: {}", result.stderr.trim())));
        }
        Ok(result)
    }

    async fn copy(&self, from: String, to: String, what: &str) -> Result<()> {
        let mut cmd = Command::new("scp");
        self.configure(&mut cmd, true);
        cmd.arg("-q").arg(&from).arg(&to);
        debug!("scp {from} -> {to}");

        let output = self.run(cmd, what).await?;
        if !output.success() {
            return Err(self.transport_error(format!(
                "{what} {from} -> {to} failed ({}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

impl RemoteTransport for SshTransport {
    fn host(&self) -> &str {
        &self.settings.host
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut cmd = Command::new("ssh");
            self.configure(&mut cmd, false);
            cmd.arg("-M")
                .arg("-o")
                .arg("ControlPersist=yes")
                .arg("-fN")
                .arg(self.settings.destination());

            let output = self.run(cmd, "ssh connect").await.map_err(|e| match e {
                SimconError::TransientPoll { message } => self.transport_error(message),
                other => other,
            })?;
            if !output.success() {
                return Err(self.transport_error(format!(
                    "connection refused ({}): {}",
                    output.exit_code,
                    output.stderr.trim()
                )));
            }
            info!("Connected to {}", self.settings.destination());
            Ok(())
        })
    }

    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<CommandOutput>> {
        Box::pin(async move {
            let mut cmd = Command::new("ssh");
            self.configure(&mut cmd, false);
            cmd.arg(self.settings.destination()).arg(command);
            debug!("ssh {}: {command}", self.settings.host);
            self.run(cmd, "ssh exec").await
        })
    }

    fn upload<'a>(&'a self, local: &'a Path, remote: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let to = format!("{}:{remote}", self.settings.destination());
            self.copy(local.display().to_string(), to, "upload").await
        })
    }

    fn download<'a>(&'a self, remote: &'a str, local: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let from = format!("{}:{remote}", self.settings.destination());
            self.copy(from, local.display().to_string(), "download")
                .await
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut cmd = Command::new("ssh");
            self.configure(&mut cmd, false);
            cmd.arg("-O").arg("exit").arg(self.settings.destination());

            match self.run(cmd, "ssh disconnect").await {
                Ok(_) => {
                    info!("Disconnected from {}", self.settings.host);
                    Ok(())
                }
                Err(e) => {
                    warn!("Closing control master for {} failed: {e}", self.settings.host);
                    Err(e)
                }
            }
        })
    }
}

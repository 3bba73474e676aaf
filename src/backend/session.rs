//! Shared remote session.
//!
//! Both remote backends run over one [`RemoteSession`]. The session connects
//! lazily when the first remote job is dispatched and disconnects when the last
//! one is retired, so a run without remote jobs never opens a connection and a
//! run with many opens exactly one.
//!
//! Job directories travel as gzip'd tar archives: the local directory is packed
//! and unpacked on the remote side before dispatch, and the remote directory is
//! packed and unpacked locally on fetch.

use crate::backend::transport::{CommandOutput, RemoteTransport};
use crate::backend::JobPaths;
use crate::error::{Result, SimconError};
use crate::job::sh_quote;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct SessionState {
    connected: bool,
    refs: usize,
}

/// Reference-counted connection to the remote simulation host.
pub struct RemoteSession {
    transport: Arc<dyn RemoteTransport>,
    root: String,
    state: Mutex<SessionState>,
}

impl RemoteSession {
    /// Creates a session for `transport`, rooted at the remote `root` path.
    #[must_use]
    pub fn new(transport: Arc<dyn RemoteTransport>, root: impl Into<String>) -> Self {
        let root = root.into().trim_end_matches('/').to_string();
        Self {
            transport,
            root,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Returns the remote host name.
    #[must_use]
    pub fn host(&self) -> &str {
        self.transport.host()
    }

    /// Returns the remote simulation root.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Returns the remote directory of a job.
    #[must_use]
    pub fn remote_dir(&self, relative: &Path) -> String {
        format!("{}/{}", self.root, relative.display())
    }

    /// Returns true while the connection is open.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    /// Registers one more job on the session, connecting first if needed.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the host cannot be reached or the remote root
    /// cannot be created.
    pub async fn acquire(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            info!("Opening remote session to {}", self.host());
            self.transport.connect().await?;
            state.connected = true;

            let mkdir = format!("mkdir -p {}", sh_quote(&self.root));
            if let Err(e) = self.exec_checked(&mkdir).await {
                state.connected = false;
                if let Err(d) = self.transport.disconnect().await {
                    debug!("Disconnect from {} failed: {d}", self.host());
                }
                return Err(SimconError::Transport {
                    host: self.host().to_string(),
                    message: format!("cannot create simulation root {}: {e}", self.root),
                });
            }
        }
        state.refs += 1;
        debug!("Remote session on {} has {} job(s)", self.host(), state.refs);
        Ok(())
    }

    /// Unregisters one job, disconnecting after the last.
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 && state.connected {
            self.close(&mut state).await;
        }
    }

    /// Closes the connection regardless of registered jobs.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.refs = 0;
        if state.connected {
            self.close(&mut state).await;
        }
    }

    async fn close(&self, state: &mut SessionState) {
        if let Err(e) = self.transport.disconnect().await {
            warn!("Disconnect from {} failed: {e}", self.host());
        }
        state.connected = false;
        info!("Closed remote session to {}", self.host());
    }

    /// Runs a remote command, returning its output whatever the exit code.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.transport.exec(command).await
    }

    /// Runs a remote command that must exit with code 0.
    ///
    /// # Errors
    ///
    /// Propagates transport errors; a non-zero exit is `SimulationFailed`.
    pub async fn exec_checked(&self, command: &str) -> Result<CommandOutput> {
        let output = self.transport.exec(command).await?;
        if !output.success() {
            return Err(SimconError::SimulationFailed {
                reason: format!(
                    "remote command `{command}` exited with {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }
        Ok(output)
    }

    /// Copies the local job directory to the remote host, replacing any
    /// previous remote copy.
    ///
    /// # Errors
    ///
    /// Returns an error if packing, copying or unpacking fails.
    pub async fn upload_dir(&self, paths: &JobPaths) -> Result<()> {
        let archive_name = archive_name();
        let local_archive = std::env::temp_dir().join(&archive_name);
        let remote_archive = format!("{}/{archive_name}", self.root);

        let result: Result<()> = async {
            run_tar(
                Command::new("tar")
                    .arg("-czf")
                    .arg(&local_archive)
                    .arg("-C")
                    .arg(&paths.local_root)
                    .arg(&paths.relative),
                "pack job directory",
            )
            .await?;

            self.transport.upload(&local_archive, &remote_archive).await?;

            let unpack = format!(
                "cd {root} && rm -rf {rel} && tar -xzf {archive} && rm -f {archive}",
                root = sh_quote(&self.root),
                rel = sh_quote(&paths.relative.display().to_string()),
                archive = sh_quote(&archive_name),
            );
            self.exec_checked(&unpack).await?;
            Ok(())
        }
        .await;

        remove_local(&local_archive);
        if result.is_ok() {
            debug!("Uploaded {} to {}", paths.relative.display(), self.host());
        }
        result
    }

    /// Copies the remote job directory back over the local one.
    ///
    /// # Errors
    ///
    /// Returns an error if packing, copying or unpacking fails.
    pub async fn fetch_dir(&self, paths: &JobPaths) -> Result<()> {
        let archive_name = archive_name();
        let local_archive = std::env::temp_dir().join(&archive_name);

        let result: Result<()> = async {
            let pack = format!(
                "cd {root} && tar -czf {archive} {rel}",
                root = sh_quote(&self.root),
                archive = sh_quote(&archive_name),
                rel = sh_quote(&paths.relative.display().to_string()),
            );
            self.exec_checked(&pack).await?;

            let remote_archive = format!("{}/{archive_name}", self.root);
            let downloaded = self.transport.download(&remote_archive, &local_archive).await;
            let cleanup = format!("rm -f {}", sh_quote(&remote_archive));
            if let Err(e) = self.transport.exec(&cleanup).await {
                warn!("Failed to remove {remote_archive} on {}: {e}", self.host());
            }
            downloaded?;

            run_tar(
                Command::new("tar")
                    .arg("-xzf")
                    .arg(&local_archive)
                    .arg("-C")
                    .arg(&paths.local_root),
                "unpack job directory",
            )
            .await
        }
        .await;

        remove_local(&local_archive);
        if result.is_ok() {
            debug!("Fetched {} from {}", paths.relative.display(), self.host());
        }
        result
    }
}

fn archive_name() -> String {
    format!(".simcon-{}.tar.gz", Uuid::new_v4())
}

fn remove_local(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {e}", path.display());
        }
    }
}

async fn run_tar(cmd: &mut Command, what: &str) -> Result<()> {
    let output = cmd
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SimconError::SimulationFailed {
            reason: format!("{what}: failed to run tar: {e}"),
        })?;
    if !output.status.success() {
        return Err(SimconError::SimulationFailed {
            reason: format!(
                "{what}: tar exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::transport::tests::ShellTransport;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    fn session(remote: &Path) -> (Arc<ShellTransport>, RemoteSession) {
        let transport = Arc::new(ShellTransport::new());
        let root = remote.join("sims").display().to_string();
        let session = RemoteSession::new(transport.clone(), root);
        (transport, session)
    }

    #[tokio::test]
    async fn test_lazy_connect_and_refcount() {
        let remote = tempfile::tempdir().unwrap();
        let (transport, session) = session(remote.path());
        assert!(!session.is_connected().await);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);

        session.acquire().await.unwrap();
        session.acquire().await.unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert!(remote.path().join("sims").is_dir());

        session.release().await;
        assert!(session.is_connected().await);
        session.release().await;
        assert!(!session.is_connected().await);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_transport_error() {
        let remote = tempfile::tempdir().unwrap();
        let (transport, session) = session(remote.path());
        transport.fail_connect.store(true, Ordering::SeqCst);

        let err = session.acquire().await.unwrap_err();
        assert!(err.is_transport());
        assert!(!session.is_connected().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_root_bootstrap_failure_disconnects() {
        let remote = tempfile::tempdir().unwrap();
        let blocker = remote.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let transport = Arc::new(ShellTransport::new());
        let session = RemoteSession::new(
            transport.clone(),
            blocker.join("sims").display().to_string(),
        );

        let err = session.acquire().await.unwrap_err();
        assert!(err.is_transport());
        assert!(!session.is_connected().await);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_upload_and_fetch_round_trip() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let (_transport, session) = session(remote.path());
        session.acquire().await.unwrap();

        let paths = JobPaths::new(local.path(), "npnabc/gummel_def");
        std::fs::create_dir_all(paths.workdir()).unwrap();
        std::fs::write(paths.workdir().join("netlist.cir"), "* netlist").unwrap();

        session.upload_dir(&paths).await.unwrap();
        let remote_dir = PathBuf::from(session.remote_dir(&paths.relative));
        assert_eq!(
            std::fs::read_to_string(remote_dir.join("netlist.cir")).unwrap(),
            "* netlist"
        );

        std::fs::write(remote_dir.join("output.dat"), "V I\n0 1\n").unwrap();
        session.fetch_dir(&paths).await.unwrap();
        assert!(paths.workdir().join("output.dat").exists());

        // no archives are left behind on either side
        let leftovers = std::fs::read_dir(remote.path().join("sims"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tar.gz"))
            .count();
        assert_eq!(leftovers, 0);

        session.shutdown().await;
        assert!(!session.is_connected().await);
    }

    #[test]
    fn test_remote_dir() {
        let transport = Arc::new(ShellTransport::new());
        let session = RemoteSession::new(transport, "/scratch/sims/");
        assert_eq!(session.root(), "/scratch/sims");
        assert_eq!(
            session.remote_dir(Path::new("npn1/dc_2")),
            "/scratch/sims/npn1/dc_2"
        );
    }
}

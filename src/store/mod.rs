//! Content-addressed result store.
//!
//! Every job owns one directory under the simulation root:
//!
//! ```text
//! <root>/<device-name><device-identity>/<sweep-name>_<sweep-identity>/
//! ```
//!
//! The directory holds simulator inputs, `sim.log` and simulator artifacts.
//! After a job succeeded its parsed [`ResultSet`] is written to `results.json`
//! and then a completion marker is renamed into place. Only directories with a
//! marker count as cached; anything else is a leftover of a crashed or failed
//! run and is deleted before the job is dispatched again.
//!
//! # Example
//!
//! ```rust,no_run
//! use simcon::store::ResultStore;
//! use std::path::PathBuf;
//!
//! # fn example(job: &simcon::job::Job) -> simcon::error::Result<()> {
//! let store = ResultStore::new(PathBuf::from("./simulations"))?;
//! let key = store.key(job);
//!
//! if !store.exists(&key) {
//!     let workdir = store.materialize(&key)?;
//!     // ... run the simulator in `workdir`, then
//!     // store.commit(&key, &results)?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, SimconError};
use crate::job::{Job, JobId, ResultSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// File name of the completion marker.
pub const MARKER_FILE_NAME: &str = ".simcon-complete";

/// File name of the persisted result set.
pub const RESULTS_FILE_NAME: &str = "results.json";

/// File name of the combined stdout/stderr log inside a job directory.
pub const LOG_FILE_NAME: &str = "sim.log";

/// Location of one job inside the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    /// Composite identity of the job.
    pub job_id: JobId,
    /// `<device-name><device-identity>`
    pub device_dir: String,
    /// `<sweep-name>_<sweep-identity>`
    pub sweep_dir: String,
}

impl StoreKey {
    /// Builds the key for a job.
    #[must_use]
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id(),
            device_dir: job.device_dir_name(),
            sweep_dir: job.sweep_dir_name(),
        }
    }

    /// Path of the job directory relative to a simulation root.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        Path::new(&self.device_dir).join(&self.sweep_dir)
    }
}

/// Contents of the completion marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMarker {
    /// Composite identity the directory was committed for.
    pub job_id: JobId,
    /// Commit time.
    pub committed_at: SystemTime,
}

/// Filesystem cache of simulation results.
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    /// Opens (and creates) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root).map_err(|e| SimconError::Store {
            path: root.clone(),
            reason: format!("failed to create simulation root: {e}"),
        })?;
        debug!("ResultStore opened at {}", root.display());
        Ok(Self { root })
    }

    /// Returns the simulation root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the store key of a job.
    #[must_use]
    pub fn key(&self, job: &Job) -> StoreKey {
        StoreKey::for_job(job)
    }

    /// Returns the job directory without touching the filesystem.
    #[must_use]
    pub fn working_dir(&self, key: &StoreKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Returns true if the job directory carries a completion marker.
    #[must_use]
    pub fn exists(&self, key: &StoreKey) -> bool {
        self.working_dir(key).join(MARKER_FILE_NAME).is_file()
    }

    /// Returns true if the job directory exists but was never committed.
    #[must_use]
    pub fn is_stale(&self, key: &StoreKey) -> bool {
        let dir = self.working_dir(key);
        dir.is_dir() && !dir.join(MARKER_FILE_NAME).is_file()
    }

    /// Returns an empty job directory, ready for inputs.
    ///
    /// A committed directory is returned untouched. An uncommitted leftover is
    /// deleted and recreated.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or cleared.
    pub fn materialize(&self, key: &StoreKey) -> Result<PathBuf> {
        let dir = self.working_dir(key);
        if self.exists(key) {
            return Ok(dir);
        }
        if dir.exists() {
            warn!(
                "Removing uncommitted job directory {} before re-dispatch",
                dir.display()
            );
            std::fs::remove_dir_all(&dir).map_err(|e| SimconError::Store {
                path: dir.clone(),
                reason: format!("failed to clear stale directory: {e}"),
            })?;
        }
        std::fs::create_dir_all(&dir).map_err(|e| SimconError::Store {
            path: dir.clone(),
            reason: format!("failed to create job directory: {e}"),
        })?;
        Ok(dir)
    }

    /// Deletes a job directory (committed or not). Missing directories are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn delete(&self, key: &StoreKey) -> Result<()> {
        let dir = self.working_dir(key);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!("Deleted job directory {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SimconError::Store {
                path: dir,
                reason: format!("failed to delete job directory: {e}"),
            }),
        }
    }

    /// Persists `results` and marks the job directory complete.
    ///
    /// The marker is written last, through a temporary file and a rename, so a
    /// crash at any point leaves the directory uncommitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing or a file cannot be written.
    pub fn commit(&self, key: &StoreKey, results: &ResultSet) -> Result<()> {
        let dir = self.working_dir(key);
        if !dir.is_dir() {
            return Err(SimconError::Store {
                path: dir,
                reason: "job directory missing at commit".to_string(),
            });
        }

        let body = serde_json::to_vec_pretty(results)?;
        std::fs::write(dir.join(RESULTS_FILE_NAME), body)?;

        let marker = CompletionMarker {
            job_id: key.job_id,
            committed_at: SystemTime::now(),
        };
        let tmp = dir.join(format!("{MARKER_FILE_NAME}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec(&marker)?)?;
        std::fs::rename(&tmp, dir.join(MARKER_FILE_NAME))?;

        info!("Committed results of job {} to {}", key.job_id, dir.display());
        Ok(())
    }

    /// Loads the committed result set of a job.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is not committed, the marker belongs to a
    /// different job, or the results cannot be read.
    pub fn load(&self, key: &StoreKey) -> Result<ResultSet> {
        let dir = self.working_dir(key);
        let marker = self.marker(key)?;
        if marker.job_id != key.job_id {
            return Err(SimconError::Store {
                path: dir,
                reason: format!(
                    "marker belongs to job {} instead of {}",
                    marker.job_id, key.job_id
                ),
            });
        }
        let body = std::fs::read(dir.join(RESULTS_FILE_NAME))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Reads the completion marker of a job.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker is missing or unreadable.
    pub fn marker(&self, key: &StoreKey) -> Result<CompletionMarker> {
        let path = self.working_dir(key).join(MARKER_FILE_NAME);
        let body = std::fs::read(&path).map_err(|e| SimconError::Store {
            path: path.clone(),
            reason: format!("no completion marker: {e}"),
        })?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Returns the last `lines` lines of the job log, if any.
#[must_use]
pub fn log_tail(workdir: &Path, lines: usize) -> Option<String> {
    let content = std::fs::read_to_string(workdir.join(LOG_FILE_NAME)).ok()?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Some(all[start..].join("\n"))
}

//! Devices, jobs and result sets.
//!
//! A [`Job`] pairs a [`Device`] with a [`Sweep`]. Its [`JobId`] is the
//! fingerprint of both identities and is the key for deduplication and for the
//! result store.

use crate::error::{Result, SimconError};
use crate::hash::{Digest, Fingerprint};
use crate::sweep::Sweep;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Execution backend a device declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Child process on this machine.
    Local,
    /// Background process started over a remote shell session.
    RemoteInteractive,
    /// Job submitted to a remote batch-queue scheduler.
    RemoteBatch,
}

impl BackendKind {
    /// Returns true for backends that need the remote transport.
    #[must_use]
    pub const fn is_remote(self) -> bool {
        matches!(self, Self::RemoteInteractive | Self::RemoteBatch)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::RemoteInteractive => f.write_str("remote_interactive"),
            Self::RemoteBatch => f.write_str("remote_batch"),
        }
    }
}

/// Command line that starts a simulator inside the job directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCommand {
    /// Executable name or path.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl StartCommand {
    /// Creates a command.
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Renders the command for a POSIX shell, quoting every word.
    #[must_use]
    pub fn to_shell(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|word| sh_quote(word))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for StartCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Quotes a word for a POSIX shell.
#[must_use]
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// A simulatable entity.
///
/// Implementations describe one device (or circuit) for one simulator. The
/// controller only talks to simulators through this trait.
pub trait Device: Send + Sync {
    /// Human-readable name, used as directory prefix.
    fn name(&self) -> &str;

    /// Content identity over the full configuration, including auxiliary files.
    fn identity(&self) -> Digest;

    /// Writes simulator inputs for `sweep` into the (empty) `workdir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs cannot be written.
    fn prepare(&self, sweep: &Sweep, workdir: &Path) -> Result<()>;

    /// Command that starts the simulator, run with `workdir` as current directory.
    fn start_command(&self) -> StartCommand;

    /// Backend this device runs on.
    fn backend_kind(&self) -> BackendKind;

    /// Checks the artifacts in `workdir` after the process finished.
    ///
    /// # Errors
    ///
    /// `SimulationFailed` if the simulator reported an error,
    /// `SimulationIncomplete` if expected output is missing.
    fn validate(&self, sweep: &Sweep, workdir: &Path) -> Result<()>;

    /// Reads the simulator output in `workdir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the output cannot be parsed.
    fn parse_results(&self, sweep: &Sweep, workdir: &Path) -> Result<ResultSet>;

    /// Per-device timeout; the controller uses the larger of this and its own.
    fn timeout_override(&self) -> Option<Duration> {
        None
    }
}

/// Composite identity of a job: fingerprint of device and sweep identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Digest);

impl JobId {
    /// Computes the composite identity.
    #[must_use]
    pub fn new(device: Digest, sweep: Digest) -> Self {
        Self(Fingerprint::new().item(device).item(sweep).finish())
    }

    /// Returns the underlying digest.
    #[must_use]
    pub const fn digest(&self) -> Digest {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A (device, sweep) pairing submitted for execution.
#[derive(Clone)]
pub struct Job {
    device: Arc<dyn Device>,
    sweep: Arc<Sweep>,
    device_identity: Digest,
    sweep_identity: Digest,
    id: JobId,
}

impl Job {
    /// Creates a job. Identities are computed once here.
    #[must_use]
    pub fn new(device: Arc<dyn Device>, sweep: Arc<Sweep>) -> Self {
        let device_identity = device.identity();
        let sweep_identity = sweep.identity();
        Self {
            device,
            sweep,
            device_identity,
            sweep_identity,
            id: JobId::new(device_identity, sweep_identity),
        }
    }

    /// Returns the composite identity.
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Returns the device.
    #[must_use]
    pub fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    /// Returns the sweep.
    #[must_use]
    pub fn sweep(&self) -> &Sweep {
        &self.sweep
    }

    /// Returns the device identity.
    #[must_use]
    pub const fn device_identity(&self) -> Digest {
        self.device_identity
    }

    /// Returns the sweep identity.
    #[must_use]
    pub const fn sweep_identity(&self) -> Digest {
        self.sweep_identity
    }

    /// Directory name for the device: `<name><identity>`.
    #[must_use]
    pub fn device_dir_name(&self) -> String {
        format!("{}{}", self.device.name(), self.device_identity)
    }

    /// Directory name for the sweep: `<name>_<identity>`.
    #[must_use]
    pub fn sweep_dir_name(&self) -> String {
        format!("{}_{}", self.sweep.name(), self.sweep_identity)
    }

    /// Short label for log lines.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}", self.device.name(), self.sweep.name())
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("device", &self.device.name())
            .field("sweep", &self.sweep.name())
            .finish()
    }
}

/// An ordered batch of jobs.
#[derive(Debug, Default, Clone)]
pub struct JobBatch {
    jobs: Vec<Job>,
}

impl JobBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one device with one sweep.
    #[must_use]
    pub fn add(mut self, device: Arc<dyn Device>, sweep: Arc<Sweep>) -> Self {
        self.jobs.push(Job::new(device, sweep));
        self
    }

    /// Adds every device with every sweep.
    #[must_use]
    pub fn add_product(mut self, devices: &[Arc<dyn Device>], sweeps: &[Arc<Sweep>]) -> Self {
        for device in devices {
            for sweep in sweeps {
                self.jobs.push(Job::new(Arc::clone(device), Arc::clone(sweep)));
            }
        }
        self
    }

    /// Returns the number of jobs, duplicates included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Returns the jobs in submission order.
    #[must_use]
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Collapses jobs sharing a composite identity, keeping the first.
    #[must_use]
    pub fn deduplicate(self) -> Vec<Job> {
        let mut seen = HashSet::with_capacity(self.jobs.len());
        self.jobs
            .into_iter()
            .filter(|job| seen.insert(job.id()))
            .collect()
    }
}

/// Output data of one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    #[serde(with = "column_values")]
    columns: BTreeMap<String, Vec<f64>>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl ResultSet {
    /// Creates an empty result set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column.
    #[must_use]
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.columns.insert(name.into(), values);
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Inserts a column.
    pub fn insert_column(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.columns.insert(name.into(), values);
    }

    /// Inserts a metadata entry.
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Returns a column.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Returns all columns.
    #[must_use]
    pub const fn columns(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.columns
    }

    /// Returns the metadata.
    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Number of rows (length of the longest column).
    #[must_use]
    pub fn rows(&self) -> usize {
        self.columns.values().map(Vec::len).max().unwrap_or(0)
    }
}

/// Column encoding that keeps non-finite values.
///
/// JSON has no NaN or infinity, so those are written as the strings `"NaN"`,
/// `"inf"` and `"-inf"`. A `null` left by an older writer reads back as NaN.
mod column_values {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Value {
        Number(f64),
        Special(String),
        Null(()),
    }

    impl From<f64> for Value {
        fn from(v: f64) -> Self {
            if v.is_finite() {
                Self::Number(v)
            } else {
                Self::Special(v.to_string())
            }
        }
    }

    pub fn serialize<S: Serializer>(
        columns: &BTreeMap<String, Vec<f64>>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&str, Vec<Value>> = columns
            .iter()
            .map(|(name, values)| {
                (name.as_str(), values.iter().copied().map(Value::from).collect())
            })
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<BTreeMap<String, Vec<f64>>, D::Error> {
        let encoded = BTreeMap::<String, Vec<Value>>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(name, values)| {
                let values = values
                    .into_iter()
                    .map(|value| match value {
                        Value::Number(v) => Ok(v),
                        Value::Null(()) => Ok(f64::NAN),
                        Value::Special(text) => text
                            .parse::<f64>()
                            .ok()
                            .filter(|v| !v.is_finite())
                            .ok_or_else(|| {
                                D::Error::custom(format!("invalid value {text:?} in column {name}"))
                            }),
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok((name, values))
            })
            .collect()
    }
}

/// Results of one device, keyed by sweep key (`<sweep-name>_<sweep-identity>`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    entries: BTreeMap<String, ResultSet>,
}

impl Dataset {
    /// Creates an empty dataset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a result set. A key is merged at most once; later merges of the
    /// same key are ignored and return `false`.
    pub fn merge(&mut self, sweep_key: impl Into<String>, results: ResultSet) -> bool {
        match self.entries.entry(sweep_key.into()) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(results);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    /// Returns the results of one sweep.
    #[must_use]
    pub fn get(&self, sweep_key: &str) -> Option<&ResultSet> {
        self.entries.get(sweep_key)
    }

    /// Returns the number of merged sweeps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was merged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over (sweep key, results).
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResultSet)> {
        self.entries.iter()
    }
}

/// Copies auxiliary files into a job directory, keeping their file names.
///
/// # Errors
///
/// Returns an error if a file has no name or cannot be copied.
pub fn copy_auxiliary_files(files: &[PathBuf], workdir: &Path) -> Result<()> {
    for file in files {
        let name = file.file_name().ok_or_else(|| SimconError::InvalidJob {
            reason: format!("auxiliary file without name: {}", file.display()),
        })?;
        std::fs::copy(file, workdir.join(name))?;
    }
    Ok(())
}

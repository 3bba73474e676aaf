//! Generic circuit-simulator device.
//!
//! [`CircuitDevice`] is the [`Device`] shipped with simcon. It renders a netlist
//! through a [`CircuitBuilder`], runs a configured simulator command on it and
//! reads back a whitespace-separated table:
//!
//! ```text
//! V_B      V_C   I_C
//! 0.50     1.0   1.2e-9
//! 0.55     1.0   8.1e-9
//! ```
//!
//! # Example
//!
//! ```
//! use simcon::circuit::{CircuitDevice, TemplateBuilder};
//! use simcon::job::{Device, StartCommand};
//! use std::sync::Arc;
//!
//! let builder = Arc::new(TemplateBuilder::new(
//!     "hbt",
//!     "Q1 c b e {model}\n.dc VB {sweep.V_B}\n",
//! ));
//! let device = CircuitDevice::builder("npn", builder)
//!     .parameter("model", "npn_hicum")
//!     .command(StartCommand::new("ngspice", ["-b", "netlist.cir"]))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(device.name(), "npn");
//! ```

use crate::error::{Result, SimconError};
use crate::hash::{Digest, Fingerprint};
use crate::job::{copy_auxiliary_files, BackendKind, Device, ResultSet, StartCommand};
use crate::store::LOG_FILE_NAME;
use crate::sweep::{validate_name, Sweep};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default netlist file name.
pub const DEFAULT_INPUT_FILE: &str = "netlist.cir";

/// Default output table file name.
pub const DEFAULT_OUTPUT_FILE: &str = "output.dat";

/// Per-technology netlist generation.
pub trait CircuitBuilder: Send + Sync {
    /// Technology name, e.g. `hbt` or `mos`.
    fn technology(&self) -> &str;

    /// Text that fully determines the generated circuits. Part of the device
    /// identity.
    fn source(&self) -> String;

    /// Renders the netlist for `sweep`.
    ///
    /// # Errors
    ///
    /// Returns an error if the circuit cannot be built from the inputs.
    fn build_circuit(&self, parameters: &BTreeMap<String, String>, sweep: &Sweep)
        -> Result<String>;
}

/// Builder filling placeholders in a netlist template.
///
/// `{name}` is replaced by a device parameter (or, failing that, a sweep
/// constant) and `{sweep.VAR}` by the space-separated points of axis `VAR`.
/// `{{` and `}}` produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateBuilder {
    technology: String,
    template: String,
}

impl TemplateBuilder {
    /// Creates a builder from template text.
    #[must_use]
    pub fn new(technology: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            technology: technology.into(),
            template: template.into(),
        }
    }

    /// Reads the template from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn from_file(technology: impl Into<String>, path: &Path) -> Result<Self> {
        let template = std::fs::read_to_string(path).map_err(|e| SimconError::InvalidJob {
            reason: format!("cannot read template {}: {e}", path.display()),
        })?;
        Ok(Self::new(technology, template))
    }

    fn lookup(
        placeholder: &str,
        parameters: &BTreeMap<String, String>,
        sweep: &Sweep,
    ) -> Result<String> {
        if let Some(variable) = placeholder.strip_prefix("sweep.") {
            let axis = sweep.axis(variable).ok_or_else(|| SimconError::InvalidJob {
                reason: format!("sweep '{}' has no axis '{variable}'", sweep.name()),
            })?;
            let points: Vec<String> = axis.values.values().iter().map(f64::to_string).collect();
            return Ok(points.join(" "));
        }
        parameters
            .get(placeholder)
            .or_else(|| sweep.constants().get(placeholder))
            .cloned()
            .ok_or_else(|| SimconError::InvalidJob {
                reason: format!("no value for template placeholder '{{{placeholder}}}'"),
            })
    }
}

impl CircuitBuilder for TemplateBuilder {
    fn technology(&self) -> &str {
        &self.technology
    }

    fn source(&self) -> String {
        self.template.clone()
    }

    fn build_circuit(
        &self,
        parameters: &BTreeMap<String, String>,
        sweep: &Sweep,
    ) -> Result<String> {
        let mut out = String::with_capacity(self.template.len());
        let mut chars = self.template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut placeholder = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => placeholder.push(ch),
                            None => {
                                return Err(SimconError::InvalidJob {
                                    reason: format!("unterminated placeholder '{{{placeholder}'"),
                                })
                            }
                        }
                    }
                    out.push_str(&Self::lookup(placeholder.trim(), parameters, sweep)?);
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }
}

/// A circuit simulated by an external simulator.
pub struct CircuitDevice {
    name: String,
    builder: Arc<dyn CircuitBuilder>,
    parameters: BTreeMap<String, String>,
    auxiliary_files: Vec<PathBuf>,
    command: StartCommand,
    backend: BackendKind,
    timeout: Option<Duration>,
    input_file: String,
    output_file: String,
    error_markers: Vec<String>,
    identity: Digest,
}

impl CircuitDevice {
    /// Creates a device builder.
    #[must_use]
    pub fn builder(
        name: impl Into<String>,
        builder: Arc<dyn CircuitBuilder>,
    ) -> CircuitDeviceBuilder {
        CircuitDeviceBuilder {
            name: name.into(),
            builder,
            parameters: BTreeMap::new(),
            auxiliary_files: Vec::new(),
            command: None,
            backend: BackendKind::Local,
            timeout: None,
            input_file: DEFAULT_INPUT_FILE.to_string(),
            output_file: DEFAULT_OUTPUT_FILE.to_string(),
            error_markers: vec!["Error:".to_string()],
        }
    }

    /// Returns the circuit builder's technology.
    #[must_use]
    pub fn technology(&self) -> &str {
        self.builder.technology()
    }

    /// Returns the device parameters.
    #[must_use]
    pub const fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Returns the output table file name.
    #[must_use]
    pub fn output_file(&self) -> &str {
        &self.output_file
    }
}

impl std::fmt::Debug for CircuitDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitDevice")
            .field("name", &self.name)
            .field("technology", &self.builder.technology())
            .field("identity", &self.identity)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl Device for CircuitDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn identity(&self) -> Digest {
        self.identity
    }

    fn prepare(&self, sweep: &Sweep, workdir: &Path) -> Result<()> {
        let netlist = self.builder.build_circuit(&self.parameters, sweep)?;
        std::fs::write(workdir.join(&self.input_file), netlist)?;
        copy_auxiliary_files(&self.auxiliary_files, workdir)?;
        debug!(
            "Prepared {} for sweep {} in {}",
            self.name,
            sweep.name(),
            workdir.display()
        );
        Ok(())
    }

    fn start_command(&self) -> StartCommand {
        self.command.clone()
    }

    fn backend_kind(&self) -> BackendKind {
        self.backend
    }

    fn validate(&self, _sweep: &Sweep, workdir: &Path) -> Result<()> {
        if let Ok(log) = std::fs::read_to_string(workdir.join(LOG_FILE_NAME)) {
            // The first lines echo the command, which may mention anything.
            if let Some(line) = log.lines().skip(3).find(|line| {
                self.error_markers
                    .iter()
                    .any(|marker| line.contains(marker.as_str()))
            }) {
                return Err(SimconError::SimulationFailed {
                    reason: format!("simulator reported: {}", line.trim()),
                });
            }
        }

        if !workdir.join(&self.output_file).is_file() {
            return Err(SimconError::SimulationIncomplete {
                reason: format!("output file {} missing", self.output_file),
            });
        }
        Ok(())
    }

    fn parse_results(&self, sweep: &Sweep, workdir: &Path) -> Result<ResultSet> {
        let path = workdir.join(&self.output_file);
        let text = std::fs::read_to_string(&path)?;
        let mut results = parse_table(&text).map_err(|reason| SimconError::SimulationFailed {
            reason: format!("{}: {reason}", path.display()),
        })?;

        let missing: Vec<&str> = sweep
            .outputs()
            .iter()
            .filter(|name| results.column(name).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(SimconError::SimulationIncomplete {
                reason: format!("output columns missing: {}", missing.join(", ")),
            });
        }

        results.insert_metadata("technology", self.builder.technology());
        Ok(results)
    }

    fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Parses a whitespace-separated numeric table with a header line.
///
/// Blank lines and lines starting with `#` or `*` are skipped.
///
/// # Errors
///
/// Returns a description of the first malformed line.
pub fn parse_table(text: &str) -> std::result::Result<ResultSet, String> {
    let mut lines = text
        .lines()
        .map(str::trim)
        .enumerate()
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#') && !l.starts_with('*'));

    let Some((_, header)) = lines.next() else {
        return Err("empty output table".to_string());
    };
    let names: Vec<&str> = header.split_whitespace().collect();
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); names.len()];

    for (index, line) in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != names.len() {
            return Err(format!(
                "line {}: expected {} values, found {}",
                index + 1,
                names.len(),
                fields.len()
            ));
        }
        for (column, field) in columns.iter_mut().zip(fields) {
            let value = field
                .parse::<f64>()
                .map_err(|_| format!("line {}: '{field}' is not a number", index + 1))?;
            column.push(value);
        }
    }

    let mut results = ResultSet::new();
    for (name, values) in names.into_iter().zip(columns) {
        results.insert_column(name, values);
    }
    Ok(results)
}

/// Builder for [`CircuitDevice`].
pub struct CircuitDeviceBuilder {
    name: String,
    builder: Arc<dyn CircuitBuilder>,
    parameters: BTreeMap<String, String>,
    auxiliary_files: Vec<PathBuf>,
    command: Option<StartCommand>,
    backend: BackendKind,
    timeout: Option<Duration>,
    input_file: String,
    output_file: String,
    error_markers: Vec<String>,
}

impl CircuitDeviceBuilder {
    /// Sets a device parameter.
    #[must_use]
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Adds an auxiliary file (model card, include file) copied next to the
    /// netlist.
    #[must_use]
    pub fn auxiliary_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.auxiliary_files.push(path.into());
        self
    }

    /// Sets the simulator command. Defaults to `ngspice -b <input file>`.
    #[must_use]
    pub fn command(mut self, command: StartCommand) -> Self {
        self.command = Some(command);
        self
    }

    /// Sets the backend.
    #[must_use]
    pub const fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Sets a device-specific timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the netlist file name.
    #[must_use]
    pub fn input_file(mut self, name: impl Into<String>) -> Self {
        self.input_file = name.into();
        self
    }

    /// Sets the output table file name.
    #[must_use]
    pub fn output_file(mut self, name: impl Into<String>) -> Self {
        self.output_file = name.into();
        self
    }

    /// Replaces the log markers that flag a failed simulation.
    #[must_use]
    pub fn error_markers(mut self, markers: Vec<String>) -> Self {
        self.error_markers = markers;
        self
    }

    /// Builds the device and computes its identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or an auxiliary file is missing.
    pub fn build(self) -> Result<CircuitDevice> {
        validate_name("device", &self.name)?;
        validate_name("input file", &self.input_file)?;
        validate_name("output file", &self.output_file)?;
        for file in &self.auxiliary_files {
            if !file.is_file() {
                return Err(SimconError::InvalidJob {
                    reason: format!("auxiliary file not found: {}", file.display()),
                });
            }
        }

        let command = self
            .command
            .unwrap_or_else(|| StartCommand::new("ngspice", ["-b", self.input_file.as_str()]));

        let mut fingerprint = Fingerprint::new()
            .value(self.builder.technology())
            .value(self.builder.source())
            .value(command.to_shell())
            .value(&self.input_file)
            .value(&self.output_file);
        let mut params = String::new();
        for (key, value) in &self.parameters {
            let _ = writeln!(params, "{key}={value}");
        }
        fingerprint = fingerprint.value(params);
        for file in &self.auxiliary_files {
            fingerprint = fingerprint.file(file);
        }

        Ok(CircuitDevice {
            name: self.name,
            builder: self.builder,
            parameters: self.parameters,
            auxiliary_files: self.auxiliary_files,
            command,
            backend: self.backend,
            timeout: self.timeout,
            input_file: self.input_file,
            output_file: self.output_file,
            error_markers: self.error_markers,
            identity: fingerprint.finish(),
        })
    }
}

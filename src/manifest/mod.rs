//! TOML job manifests.
//!
//! A manifest lists circuit devices and sweeps. Every device is run with every
//! sweep unless it names the sweeps it wants:
//!
//! ```toml
//! [[device]]
//! name = "npn"
//! technology = "hbt"
//! template = "npn.cir.in"
//! parameters = { model = "npn_v1" }
//! auxiliary_files = ["models/npn.lib"]
//! command = ["ngspice", "-b", "netlist.cir"]
//! backend = "remote_interactive"
//! timeout_secs = 120
//!
//! [[sweep]]
//! name = "gummel"
//! outputs = ["I_C", "I_B"]
//! constants = { TEMP = "300" }
//!
//! [[sweep.axes]]
//! variable = "V_B"
//! kind = "linear"
//! start = 0.5
//! stop = 1.0
//! points = 11
//! ```
//!
//! Relative paths are resolved against the manifest's directory.

use crate::circuit::{CircuitBuilder, CircuitDevice, TemplateBuilder};
use crate::error::{Result, SimconError};
use crate::job::{BackendKind, Device, JobBatch, StartCommand};
use crate::sweep::Sweep;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// One `[[device]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    /// Device name.
    pub name: String,
    /// Technology of the circuit builder.
    #[serde(default = "default_technology")]
    pub technology: String,
    /// Netlist template file.
    pub template: Option<PathBuf>,
    /// Inline netlist template.
    pub netlist: Option<String>,
    /// Template parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Files copied next to the netlist.
    #[serde(default)]
    pub auxiliary_files: Vec<PathBuf>,
    /// Simulator command line, program first.
    #[serde(default)]
    pub command: Vec<String>,
    /// Backend to run on.
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Device-specific timeout.
    pub timeout_secs: Option<u64>,
    /// Netlist file name.
    pub input_file: Option<String>,
    /// Output table file name.
    pub output_file: Option<String>,
    /// Log markers of a failed simulation.
    pub error_markers: Option<Vec<String>>,
    /// Restricts the device to these sweeps.
    pub sweeps: Option<Vec<String>>,
}

fn default_technology() -> String {
    "generic".to_string()
}

const fn default_backend() -> BackendKind {
    BackendKind::Local
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFile {
    #[serde(default)]
    device: Vec<DeviceEntry>,
    #[serde(default)]
    sweep: Vec<Sweep>,
}

/// A parsed manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    devices: Vec<DeviceEntry>,
    sweeps: Vec<Arc<Sweep>>,
    base_dir: PathBuf,
}

impl Manifest {
    /// Reads a manifest file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid manifest.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SimconError::Config(format!("failed to read manifest {}: {e}", path.display()))
        })?;
        let base_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::parse(&text, base_dir)
    }

    /// Parses manifest text, resolving relative paths against `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid manifest.
    pub fn parse(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let file: ManifestFile = toml::from_str(text)
            .map_err(|e| SimconError::Config(format!("invalid manifest: {e}")))?;

        for sweep in &file.sweep {
            sweep.validate()?;
        }
        for (i, sweep) in file.sweep.iter().enumerate() {
            if file.sweep[..i].iter().any(|s| s.name() == sweep.name()) {
                return Err(SimconError::Config(format!(
                    "sweep '{}' defined twice",
                    sweep.name()
                )));
            }
        }
        for device in &file.device {
            if device.template.is_some() == device.netlist.is_some() {
                return Err(SimconError::Config(format!(
                    "device '{}' needs exactly one of `template` and `netlist`",
                    device.name
                )));
            }
            for wanted in device.sweeps.iter().flatten() {
                if !file.sweep.iter().any(|s| s.name() == wanted) {
                    return Err(SimconError::Config(format!(
                        "device '{}' refers to unknown sweep '{wanted}'",
                        device.name
                    )));
                }
            }
        }

        Ok(Self {
            devices: file.device,
            sweeps: file.sweep.into_iter().map(Arc::new).collect(),
            base_dir: base_dir.into(),
        })
    }

    /// Returns the device entries.
    #[must_use]
    pub fn devices(&self) -> &[DeviceEntry] {
        &self.devices
    }

    /// Returns the sweeps.
    #[must_use]
    pub fn sweeps(&self) -> &[Arc<Sweep>] {
        &self.sweeps
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Builds the device of one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the template or an auxiliary file cannot be read.
    pub fn build_device(&self, entry: &DeviceEntry) -> Result<Arc<dyn Device>> {
        let builder: Arc<dyn CircuitBuilder> = match (&entry.template, &entry.netlist) {
            (Some(path), _) => Arc::new(TemplateBuilder::from_file(
                entry.technology.clone(),
                &self.resolve(path),
            )?),
            (None, Some(text)) => Arc::new(TemplateBuilder::new(
                entry.technology.clone(),
                text.clone(),
            )),
            (None, None) => {
                return Err(SimconError::Config(format!(
                    "device '{}' has no template",
                    entry.name
                )))
            }
        };

        let mut device = CircuitDevice::builder(entry.name.clone(), builder).backend(entry.backend);
        for (key, value) in &entry.parameters {
            device = device.parameter(key.clone(), value.clone());
        }
        for file in &entry.auxiliary_files {
            device = device.auxiliary_file(self.resolve(file));
        }
        if let Some((program, args)) = entry.command.split_first() {
            device = device.command(StartCommand::new(program.clone(), args.iter().cloned()));
        }
        if let Some(secs) = entry.timeout_secs {
            device = device.timeout(Duration::from_secs(secs));
        }
        if let Some(name) = &entry.input_file {
            device = device.input_file(name.clone());
        }
        if let Some(name) = &entry.output_file {
            device = device.output_file(name.clone());
        }
        if let Some(markers) = &entry.error_markers {
            device = device.error_markers(markers.clone());
        }
        Ok(Arc::new(device.build()?))
    }

    /// Builds the job batch: every device with each of its sweeps.
    ///
    /// # Errors
    ///
    /// Returns an error if a device cannot be built.
    pub fn batch(&self) -> Result<JobBatch> {
        let mut batch = JobBatch::new();
        for entry in &self.devices {
            let device = self.build_device(entry)?;
            let sweeps: Vec<Arc<Sweep>> = match &entry.sweeps {
                Some(names) => self
                    .sweeps
                    .iter()
                    .filter(|s| names.iter().any(|n| n == s.name()))
                    .cloned()
                    .collect(),
                None => self.sweeps.clone(),
            };
            batch = batch.add_product(&[device], &sweeps);
        }
        Ok(batch)
    }
}

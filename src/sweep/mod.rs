//! Parameter-sweep definitions.
//!
//! A sweep is an ordered list of axes to explore for a device, plus the output
//! quantities requested and constants (temperature, frequency, ...) that hold for
//! the whole sweep. Its identity is the fingerprint of its canonical JSON form,
//! so two sweeps with the same definition share cached results.

use crate::error::{Result, SimconError};
use crate::hash::{Digest, Fingerprint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Values taken by one sweep axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AxisValues {
    /// A single fixed value.
    Constant {
        /// The value.
        value: f64,
    },
    /// Evenly spaced points from `start` to `stop`, both included.
    Linear {
        /// First point.
        start: f64,
        /// Last point.
        stop: f64,
        /// Number of points (at least 1).
        points: usize,
    },
    /// Explicit list of points.
    List {
        /// The points, in sweep order.
        values: Vec<f64>,
    },
}

impl AxisValues {
    /// Expands the axis into its points.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn values(&self) -> Vec<f64> {
        match self {
            Self::Constant { value } => vec![*value],
            Self::Linear {
                start,
                stop,
                points,
            } => match *points {
                0 => Vec::new(),
                1 => vec![*start],
                n => {
                    let step = (stop - start) / (n - 1) as f64;
                    (0..n).map(|i| start + step * i as f64).collect()
                }
            },
            Self::List { values } => values.clone(),
        }
    }
}

/// One swept (or fixed) variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepAxis {
    /// Name of the swept variable, e.g. `V_B`.
    pub variable: String,
    /// Values of the variable.
    #[serde(flatten)]
    pub values: AxisValues,
}

/// An ordered parameter-sweep plan.
///
/// # Example
///
/// ```
/// use simcon::sweep::{AxisValues, Sweep};
///
/// let sweep = Sweep::builder("gummel")
///     .linear("V_B", 0.5, 1.0, 11)
///     .constant("V_C", 1.0)
///     .output("I_C")
///     .constant_str("TEMP", "300")
///     .build()
///     .unwrap();
///
/// assert_eq!(sweep.axes().len(), 2);
/// assert_eq!(sweep.identity(), sweep.clone().identity());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sweep {
    name: String,
    #[serde(default)]
    axes: Vec<SweepAxis>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    constants: BTreeMap<String, String>,
}

impl Sweep {
    /// Creates a sweep builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> SweepBuilder {
        SweepBuilder {
            name: name.into(),
            axes: Vec::new(),
            outputs: Vec::new(),
            constants: BTreeMap::new(),
        }
    }

    /// Returns the sweep name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the axes in sweep order.
    #[must_use]
    pub fn axes(&self) -> &[SweepAxis] {
        &self.axes
    }

    /// Returns the axis for `variable`, if swept.
    #[must_use]
    pub fn axis(&self, variable: &str) -> Option<&SweepAxis> {
        self.axes.iter().find(|a| a.variable == variable)
    }

    /// Returns the requested output quantities.
    #[must_use]
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Returns the sweep-wide constants.
    #[must_use]
    pub const fn constants(&self) -> &BTreeMap<String, String> {
        &self.constants
    }

    /// Checks a sweep that did not come from the builder, e.g. one read from
    /// a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or contains a path separator, or
    /// if a variable is swept twice.
    pub fn validate(&self) -> Result<()> {
        validate_name("sweep", &self.name)?;
        for (i, axis) in self.axes.iter().enumerate() {
            if self.axes[..i].iter().any(|a| a.variable == axis.variable) {
                return Err(SimconError::InvalidJob {
                    reason: format!(
                        "sweep '{}' declares variable '{}' twice",
                        self.name, axis.variable
                    ),
                });
            }
        }
        Ok(())
    }

    /// Returns the canonical serialized definition.
    #[must_use]
    pub fn definition(&self) -> String {
        // Every field is a plain string, float or ordered map, so this cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Returns the content identity of this sweep.
    #[must_use]
    pub fn identity(&self) -> Digest {
        Fingerprint::new().value(self.definition()).finish()
    }

    /// Returns the key under which results of this sweep are stored:
    /// `<name>_<identity>`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}_{}", self.name, self.identity())
    }
}

/// Builder for `Sweep`.
#[derive(Debug)]
pub struct SweepBuilder {
    name: String,
    axes: Vec<SweepAxis>,
    outputs: Vec<String>,
    constants: BTreeMap<String, String>,
}

impl SweepBuilder {
    /// Adds an axis.
    #[must_use]
    pub fn axis(mut self, variable: impl Into<String>, values: AxisValues) -> Self {
        self.axes.push(SweepAxis {
            variable: variable.into(),
            values,
        });
        self
    }

    /// Adds a linear axis.
    #[must_use]
    pub fn linear(self, variable: impl Into<String>, start: f64, stop: f64, points: usize) -> Self {
        self.axis(
            variable,
            AxisValues::Linear {
                start,
                stop,
                points,
            },
        )
    }

    /// Adds a list axis.
    #[must_use]
    pub fn list(self, variable: impl Into<String>, values: Vec<f64>) -> Self {
        self.axis(variable, AxisValues::List { values })
    }

    /// Adds a constant axis.
    #[must_use]
    pub fn constant(self, variable: impl Into<String>, value: f64) -> Self {
        self.axis(variable, AxisValues::Constant { value })
    }

    /// Requests an output quantity.
    #[must_use]
    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.outputs.push(output.into());
        self
    }

    /// Sets a sweep-wide constant.
    #[must_use]
    pub fn constant_str(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.constants.insert(key.into(), value.into());
        self
    }

    /// Builds the sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or contains a path separator, or
    /// if a variable is swept twice.
    pub fn build(self) -> Result<Sweep> {
        let sweep = Sweep {
            name: self.name,
            axes: self.axes,
            outputs: self.outputs,
            constants: self.constants,
        };
        sweep.validate()?;
        Ok(sweep)
    }
}

/// Checks that a device or sweep name can be used as a directory name prefix.
pub(crate) fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(SimconError::InvalidJob {
            reason: format!("invalid {what} name '{name}'"),
        });
    }
    Ok(())
}

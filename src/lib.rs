//! # Simcon: Cached Simulation Job Controller
//!
//! Simcon runs batches of simulation jobs (a device paired with a parameter
//! sweep) on a local machine, a remote host over ssh, or a remote batch queue,
//! and keeps every result in a content-addressed store so unchanged jobs are
//! never run twice.
//!
//! ## Features
//!
//! - **Content addressing**: job directories are named after fingerprints of
//!   the device definition and the sweep
//! - **Crash-safe cache**: a job counts as done only once its completion
//!   marker is written, after the results
//! - **Bounded concurrency**: at most `max_concurrent` jobs run at once, each
//!   under its own timeout
//! - **Failure isolation**: one broken job never stops the others
//!
//! ## Quick Start
//!
//! ```no_run
//! use simcon::backend::local::LocalBackend;
//! use simcon::circuit::{CircuitDevice, TemplateBuilder};
//! use simcon::controller::{JobController, RunOptions};
//! use simcon::job::JobBatch;
//! use simcon::store::ResultStore;
//! use simcon::sweep::Sweep;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> simcon::error::Result<()> {
//!     let controller = JobController::builder()
//!         .store(ResultStore::new("simulations".into())?)
//!         .backend(Arc::new(LocalBackend::new()))
//!         .max_concurrent(4)
//!         .build()?;
//!
//!     let template = Arc::new(TemplateBuilder::new("generic", ".model {model}\n"));
//!     let device = CircuitDevice::builder("npn", template)
//!         .parameter("model", "npn_v1")
//!         .build()?;
//!     let sweep = Sweep::builder("gummel").linear("V_B", 0.5, 1.0, 11).build()?;
//!
//!     let batch = JobBatch::new().add(Arc::new(device), Arc::new(sweep));
//!     let report = controller.run(batch, RunOptions::default()).await?;
//!
//!     println!("{} succeeded, {} failed", report.succeeded(), report.failed());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Job**: a device and a sweep, identified by their combined fingerprint
//! - **Store**: the on-disk cache under the simulation root
//! - **Backend**: starts, polls, fetches and cancels jobs on one kind of host
//! - **Controller**: filters cached jobs, then admits the rest up to the bound

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

pub mod backend;
pub mod circuit;
pub mod config;
pub mod controller;
pub mod error;
pub mod hash;
pub mod job;
pub mod manifest;
pub mod store;
pub mod sweep;

pub use controller::{JobController, JobOutcome, RunOptions, RunReport};
pub use error::{Result, SimconError};
pub use job::{Device, Job, JobBatch, JobId};

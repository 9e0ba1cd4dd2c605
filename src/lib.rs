//! Asynchronous orchestration of host security scans, VM deployments seeded
//! from their results, and adversary-emulation runs inside those VMs.
//!
//! Every operation starts a job and returns its id immediately; the work runs
//! on a supervised background task and callers poll the job's status.

pub mod config;
pub mod deploy;
pub mod emulation;
pub mod error;
pub mod jobs;
pub mod process;
pub mod scan;
pub mod shutdown;
pub mod vm;
pub mod worker;

pub use error::{DittoError, Result};

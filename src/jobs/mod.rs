//! Job records and the registry that stores them.
//!
//! Every job kind (scan, deployment, emulation) uses the same record shape:
//! a phase from the kind's own [`JobPhase`] vocabulary, progress, message and
//! error text, timestamps, a cancellation token and a kind-specific detail
//! struct. Records live in a [`JobRegistry`] owned by the kind's service.

pub mod job;
pub mod registry;

pub use job::{generate_id, retention_cutoff, unique_nanos, JobPhase, JobRecord, JobStatus};
pub use registry::JobRegistry;

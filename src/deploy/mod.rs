//! VM deployment jobs.
//!
//! Phases: `preparing → initializing → deploying → running`. Once the VM is
//! up the deployment mirrors its power state (`running`, `stopped`, `saved`),
//! which can change in any order. `error` and `cancelled` are terminal.
//!
//! Each deployment owns at most one VM handle. Cancelling or deleting the
//! deployment destroys that VM.

pub mod model;
pub mod service;

pub use model::{DeployDetail, DeployJob, DeployPhase, DeploymentStatus, ResourceUsage};
pub use service::{DeploymentService, VmTargetResolver};

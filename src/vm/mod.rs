//! Virtual machine controller.
//!
//! VM instances are owned by an external hypervisor and driven through two
//! CLIs with different status vocabularies. This module normalises both into
//! [`CanonicalState`] and exposes the lifecycle through [`VmLifecycle`], which
//! the deployment and emulation services depend on.
//!
//! # Status resolution
//!
//! [`StateResolver`] asks its backends in order (hypervisor, then
//! provisioning tool). Unrecognised answers fall through to the next backend
//! and end up as [`CanonicalState::Unknown`]; `NotCreated` is only reported
//! when a backend says so explicitly.

pub mod backend;
pub mod controller;
pub mod descriptor;
pub mod state;

use async_trait::async_trait;

use crate::error::Result;

pub use backend::{HypervisorCli, ProvisionerCli, StateResolver, StatusBackend, VmInstance};
pub use controller::{VmController, VmInfo};
pub use state::{parse_hypervisor_state, CanonicalState, StatusLineParser, SubstringStatusParser};

/// Data a new instance is seeded with
#[derive(Debug, Clone)]
pub struct VmSeed {
    pub scan_id: String,
    pub deployment_id: String,
    /// Written verbatim as the instance's seed file
    pub data: serde_json::Value,
}

#[async_trait]
pub trait VmLifecycle: Send + Sync {
    /// Provision a new instance and return its handle.
    async fn create(&self, seed: &VmSeed) -> Result<String>;

    async fn start(&self, handle: &str) -> Result<()>;

    async fn stop(&self, handle: &str) -> Result<()>;

    /// Tear the instance down and forget it.
    async fn destroy(&self, handle: &str) -> Result<()>;

    async fn status(&self, handle: &str) -> Result<CanonicalState>;

    /// Run a PowerShell snippet inside the guest.
    async fn exec_guest(&self, handle: &str, script: &str) -> Result<()>;
}

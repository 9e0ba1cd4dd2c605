use std::fmt;

use serde::Serialize;

use crate::jobs::{JobPhase, JobRecord, JobStatus};
use crate::vm::CanonicalState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    Preparing,
    Initializing,
    Deploying,
    Running,
    Stopped,
    Saved,
    Error,
    Cancelled,
}

impl DeployPhase {
    /// Phases that mirror the VM's own state once it exists
    pub fn is_steady(&self) -> bool {
        matches!(
            self,
            DeployPhase::Running | DeployPhase::Stopped | DeployPhase::Saved
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployPhase::Preparing => "preparing",
            DeployPhase::Initializing => "initializing",
            DeployPhase::Deploying => "deploying",
            DeployPhase::Running => "running",
            DeployPhase::Stopped => "stopped",
            DeployPhase::Saved => "saved",
            DeployPhase::Error => "error",
            DeployPhase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl JobPhase for DeployPhase {
    fn rank(&self) -> u8 {
        match self {
            DeployPhase::Preparing => 0,
            DeployPhase::Initializing => 1,
            DeployPhase::Deploying => 2,
            DeployPhase::Running | DeployPhase::Stopped | DeployPhase::Saved => 3,
            DeployPhase::Error | DeployPhase::Cancelled => u8::MAX,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, DeployPhase::Error | DeployPhase::Cancelled)
    }

    fn error() -> Self {
        DeployPhase::Error
    }

    fn cancelled() -> Self {
        DeployPhase::Cancelled
    }

    /// Once the VM exists its power state can change at any time, so the
    /// steady phases move freely between each other.
    fn is_lateral(&self, next: &Self) -> bool {
        (self.is_steady() || *self == DeployPhase::Deploying) && next.is_steady()
    }
}

/// Advisory resource usage snapshot, in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

impl ResourceUsage {
    /// Placeholder reported for a running VM until real metrics exist.
    pub fn advisory() -> Self {
        Self {
            cpu: 30.0,
            memory: 40.0,
            disk: 20.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployDetail {
    pub name: String,
    pub scan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_handle: Option<String>,
    #[serde(skip)]
    handle_released: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

impl DeployDetail {
    pub fn new(scan_id: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.into(),
            ..Self::default()
        }
    }

    /// Record the VM handle. A deployment gets at most one handle in its
    /// lifetime; once released it is never reassigned.
    pub fn assign_handle(&mut self, handle: impl Into<String>) -> bool {
        if self.vm_handle.is_some() || self.handle_released {
            return false;
        }
        let handle = handle.into();
        self.name = format!("VM_{}", handle);
        self.vm_handle = Some(handle);
        true
    }

    pub fn release_handle(&mut self) -> Option<String> {
        self.handle_released = true;
        self.vm_handle.take()
    }
}

pub type DeployJob = JobRecord<DeployPhase, DeployDetail>;

/// What a poller sees for one deployment
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(flatten)]
    pub status: JobStatus<DeployPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

impl From<&DeployJob> for DeploymentStatus {
    fn from(job: &DeployJob) -> Self {
        Self {
            status: job.status.clone(),
            vm_handle: job.detail.vm_handle.clone(),
            resource_usage: job.detail.resource_usage,
        }
    }
}

/// Fold a live VM state into the deployment record.
///
/// `Unknown` leaves the record untouched: an indeterminate answer is not
/// evidence that the VM changed.
pub(crate) fn apply_live_state(job: &mut DeployJob, state: CanonicalState) {
    match state {
        CanonicalState::Running => {
            if job.advance(DeployPhase::Running, 100.0, "Virtual environment is running") {
                job.detail.resource_usage = Some(ResourceUsage::advisory());
            }
        }
        CanonicalState::Stopped => {
            job.advance(DeployPhase::Stopped, 0.0, "Virtual environment is stopped");
        }
        CanonicalState::Saved => {
            job.advance(DeployPhase::Saved, 0.0, "Virtual environment is saved");
        }
        CanonicalState::NotCreated => {
            job.fail("Virtual environment not found");
        }
        CanonicalState::Unknown => {
            tracing::debug!(job_id = %job.id, "VM state unknown, keeping stored status");
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::VmConfig;
use crate::deploy::model::{
    apply_live_state, DeployDetail, DeployJob, DeployPhase, DeploymentStatus, ResourceUsage,
};
use crate::error::{DittoError, Result};
use crate::jobs::{generate_id, JobRegistry};
use crate::scan::ScanResultSource;
use crate::vm::{CanonicalState, VmLifecycle, VmSeed};
use crate::worker::{spawn_supervised, Retention};

/// Maps a deployment to the VM an emulation should target
#[async_trait]
pub trait VmTargetResolver: Send + Sync {
    async fn vm_handle(&self, deployment_id: &str) -> Result<String>;
}

/// VM digital-twin deployments seeded from scan results.
///
/// Status reads of a deployment whose VM is up re-query the VM controller
/// outside the registry lock and write the mapped phase back. A failed query
/// returns the stored status unchanged.
pub struct DeploymentService {
    registry: Arc<JobRegistry<DeployPhase, DeployDetail>>,
    vms: Arc<dyn VmLifecycle>,
    scans: Arc<dyn ScanResultSource>,
    poll_interval: Duration,
    poll_retries: u32,
}

impl DeploymentService {
    pub fn new(
        config: &VmConfig,
        vms: Arc<dyn VmLifecycle>,
        scans: Arc<dyn ScanResultSource>,
    ) -> Self {
        Self {
            registry: Arc::new(JobRegistry::new()),
            vms,
            scans,
            poll_interval: config.poll_interval,
            poll_retries: config.poll_retries,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry<DeployPhase, DeployDetail>> {
        &self.registry
    }

    pub async fn start(&self, scan_id: &str) -> Result<String> {
        let result = self.scans.scan_result(scan_id).await?;
        let data = serde_json::to_value(&result)?;

        let id = generate_id("deploy");
        let job = DeployJob::new(
            id.clone(),
            DeployPhase::Preparing,
            "Preparing deployment...",
            DeployDetail::new(scan_id),
        );
        let token = job.token.clone();
        self.registry.insert_new(job).await?;
        tracing::info!(job_id = %id, scan_id, "Deployment started");

        let task = DeployTask {
            id: id.clone(),
            registry: self.registry.clone(),
            vms: self.vms.clone(),
            seed: VmSeed {
                scan_id: scan_id.to_string(),
                deployment_id: id.clone(),
                data,
            },
            token,
            poll_interval: self.poll_interval,
            poll_retries: self.poll_retries,
        };
        let registry = self.registry.clone();
        let fault_id = id.clone();
        spawn_supervised("deploy", id.clone(), task.run(), move |msg| async move {
            registry.mutate(&fault_id, |job| job.fail(msg)).await;
        });

        Ok(id)
    }

    /// Current status, refreshed from the VM when the deployment is in a
    /// steady phase.
    pub async fn status(&self, id: &str) -> Result<DeploymentStatus> {
        let job = self.refresh(id).await?;
        Ok(DeploymentStatus::from(&job))
    }

    async fn refresh(&self, id: &str) -> Result<DeployJob> {
        let job = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| DittoError::not_found("deployment", id))?;

        let Some(handle) = job.detail.vm_handle.clone() else {
            return Ok(job);
        };
        if !job.phase().is_steady() {
            return Ok(job);
        }

        let state = match self.vms.status(&handle).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(job_id = %id, handle = %handle, error = %e, "VM status query failed, returning stored status");
                return Ok(job);
            }
        };

        let refreshed = self
            .registry
            .mutate(id, |job| {
                if job.detail.vm_handle.as_deref() == Some(handle.as_str()) {
                    let before = job.phase();
                    apply_live_state(job, state);
                    if job.phase() != before {
                        tracing::info!(job_id = %job.id, from = %before, to = %job.phase(), "Deployment state changed");
                    }
                    job.touch();
                }
                job.clone()
            })
            .await;
        Ok(refreshed.unwrap_or(job))
    }

    async fn active_handle(&self, id: &str) -> Result<String> {
        let job = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| DittoError::not_found("deployment", id))?;
        if job.is_terminal() {
            return Err(DittoError::Conflict(format!(
                "deployment {} is {}",
                id,
                job.phase()
            )));
        }
        job.detail.vm_handle.ok_or_else(|| {
            DittoError::Conflict(format!("no VM instance found for deployment {}", id))
        })
    }

    pub async fn start_instance(&self, id: &str) -> Result<()> {
        let handle = self.active_handle(id).await?;
        self.vms.start(&handle).await?;
        self.registry
            .mutate(id, |job| job.advance(DeployPhase::Running, 100.0, "VM is running"))
            .await;
        Ok(())
    }

    pub async fn stop_instance(&self, id: &str) -> Result<()> {
        let handle = self.active_handle(id).await?;
        self.vms.stop(&handle).await?;
        self.registry
            .mutate(id, |job| job.advance(DeployPhase::Stopped, 0.0, "VM is stopped"))
            .await;
        Ok(())
    }

    /// Destroy the VM and forget the deployment. A failed destroy keeps the
    /// record. A terminal deployment that never got a VM is simply removed.
    pub async fn delete_instance(&self, id: &str) -> Result<()> {
        let job = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| DittoError::not_found("deployment", id))?;

        match &job.detail.vm_handle {
            Some(handle) => {
                self.vms
                    .destroy(handle)
                    .await
                    .map_err(|e| e.context("failed to destroy VM"))?;
            }
            None if job.is_terminal() => {}
            None => {
                return Err(DittoError::Conflict(format!(
                    "no VM instance found for deployment {}",
                    id
                )))
            }
        }

        if let Some(job) = self.registry.delete(id).await {
            job.token.cancel();
        }
        tracing::info!(job_id = %id, "Deployment deleted");
        Ok(())
    }

    /// Cancel the deployment and tear down its VM. Destroy failures are
    /// logged; the cancellation itself always completes.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let handle = self
            .registry
            .mutate(id, |job| {
                if job.cancel("Deployment cancelled by user") {
                    Ok(job.detail.release_handle())
                } else {
                    Err(DittoError::Conflict(format!(
                        "cannot cancel deployment in phase: {}",
                        job.phase()
                    )))
                }
            })
            .await
            .ok_or_else(|| DittoError::not_found("deployment", id))??;

        if let Some(handle) = handle {
            if let Err(e) = self.vms.destroy(&handle).await {
                tracing::warn!(job_id = %id, handle = %handle, error = %e, "Failed to destroy VM of cancelled deployment");
            }
        }
        tracing::info!(job_id = %id, "Deployment cancelled");
        Ok(())
    }

    /// All deployments, oldest first, each refreshed from its VM.
    pub async fn list_all(&self) -> Vec<DeployJob> {
        let mut jobs = Vec::new();
        for job in self.registry.list_all().await {
            let mut job = match self.refresh(&job.id).await {
                Ok(refreshed) => refreshed,
                // Deleted while listing
                Err(_) => continue,
            };
            if job.phase() == DeployPhase::Running && job.detail.resource_usage.is_none() {
                job.detail.resource_usage = Some(ResourceUsage::advisory());
            }
            jobs.push(job);
        }
        jobs
    }

    pub async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let mut removed = 0;
        for id in self.registry.ids_older_than(max_age).await {
            let Some(job) = self.registry.get(&id).await else {
                continue;
            };
            if let Some(handle) = &job.detail.vm_handle {
                if let Err(e) = self.vms.destroy(handle).await {
                    tracing::warn!(job_id = %id, handle = %handle, error = %e, "Failed to destroy VM of expired deployment");
                    continue;
                }
            }
            if let Some(job) = self.registry.delete(&id).await {
                job.token.cancel();
                removed += 1;
            }
        }
        removed
    }
}

#[async_trait]
impl VmTargetResolver for DeploymentService {
    async fn vm_handle(&self, deployment_id: &str) -> Result<String> {
        self.active_handle(deployment_id).await
    }
}

#[async_trait]
impl Retention for DeploymentService {
    fn kind(&self) -> &'static str {
        "deploy"
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        DeploymentService::cleanup_older_than(self, max_age).await
    }
}

struct DeployTask {
    id: String,
    registry: Arc<JobRegistry<DeployPhase, DeployDetail>>,
    vms: Arc<dyn VmLifecycle>,
    seed: VmSeed,
    token: CancellationToken,
    poll_interval: Duration,
    poll_retries: u32,
}

impl DeployTask {
    async fn run(self) -> Result<()> {
        self.registry
            .mutate(&self.id, |job| {
                job.advance(
                    DeployPhase::Initializing,
                    10.0,
                    "Setting up virtual environment...",
                )
            })
            .await;

        // Provisioning runs to completion even if the job is cancelled
        // meanwhile, so the VM can be torn down afterwards.
        let handle = self
            .vms
            .create(&self.seed)
            .await
            .map_err(|e| e.context("Deployment failed"))?;

        let assigned = self
            .registry
            .mutate(&self.id, |job| {
                if job.is_terminal() || !job.detail.assign_handle(handle.clone()) {
                    return false;
                }
                job.advance(
                    DeployPhase::Deploying,
                    50.0,
                    "Creating virtual environment...",
                )
            })
            .await
            .unwrap_or(false);

        if !assigned {
            tracing::info!(job_id = %self.id, handle = %handle, "Deployment ended during provisioning, destroying VM");
            if let Err(e) = self.vms.destroy(&handle).await {
                tracing::warn!(job_id = %self.id, handle = %handle, error = %e, "Failed to destroy orphaned VM");
            }
            return Ok(());
        }

        for attempt in 1..=self.poll_retries {
            if self.token.is_cancelled() {
                return Ok(());
            }
            match self.vms.status(&handle).await {
                Ok(CanonicalState::Running) => {
                    self.registry
                        .mutate(&self.id, |job| {
                            let ready = "Virtual environment is ready";
                            if job.advance(DeployPhase::Running, 100.0, ready) {
                                job.detail.resource_usage = Some(ResourceUsage::advisory());
                            }
                        })
                        .await;
                    tracing::info!(job_id = %self.id, handle = %handle, attempt, "VM is running");
                    return Ok(());
                }
                Ok(state) => {
                    tracing::debug!(job_id = %self.id, handle = %handle, state = %state, attempt, "Waiting for VM");
                }
                Err(e) => {
                    tracing::warn!(job_id = %self.id, handle = %handle, error = %e, attempt, "VM status check failed");
                }
            }

            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        Err(DittoError::Timeout(format!(
            "Deployment timed out after {} status checks",
            self.poll_retries
        )))
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::EmulationConfig;
use crate::deploy::VmTargetResolver;
use crate::emulation::model::{
    EmulationDetail, EmulationJob, EmulationPhase, EmulationRequest, EmulationResult,
    EmulationStatus,
};
use crate::emulation::results::parse_results;
use crate::emulation::validator::{validate_request, TechniqueValidator};
use crate::error::{DittoError, Result};
use crate::jobs::{generate_id, JobRegistry};
use crate::process::{ArtifactSpec, ProcessRunner, ProcessSpec};
use crate::vm::VmLifecycle;
use crate::worker::{spawn_supervised, Retention};

/// Resolves "deployment ids" that are already VM handles. Lets the CLI target
/// a VM that was not deployed through this process.
pub struct DirectVmResolver {
    vms: Arc<dyn VmLifecycle>,
}

impl DirectVmResolver {
    pub fn new(vms: Arc<dyn VmLifecycle>) -> Self {
        Self { vms }
    }
}

#[async_trait]
impl VmTargetResolver for DirectVmResolver {
    async fn vm_handle(&self, deployment_id: &str) -> Result<String> {
        // Fails with NotFound for handles the controller does not know
        self.vms.status(deployment_id).await?;
        Ok(deployment_id.to_string())
    }
}

/// Adversary-emulation runs against a deployed VM.
pub struct EmulationService {
    config: EmulationConfig,
    registry: Arc<JobRegistry<EmulationPhase, EmulationDetail>>,
    runner: ProcessRunner,
    vms: Arc<dyn VmLifecycle>,
    targets: Arc<dyn VmTargetResolver>,
    validator: Arc<dyn TechniqueValidator>,
}

impl EmulationService {
    pub fn new(
        config: EmulationConfig,
        vms: Arc<dyn VmLifecycle>,
        targets: Arc<dyn VmTargetResolver>,
        validator: Arc<dyn TechniqueValidator>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(JobRegistry::new()),
            runner: ProcessRunner::default(),
            vms,
            targets,
            validator,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry<EmulationPhase, EmulationDetail>> {
        &self.registry
    }

    pub async fn start(&self, request: EmulationRequest) -> Result<String> {
        validate_request(&request, self.validator.as_ref())?;
        let vm_handle = self.targets.vm_handle(&request.deployment_id).await?;

        let id = generate_id("emulation");
        let exec_dir = self.config.results_dir.join(&id);
        tokio::fs::create_dir_all(&exec_dir).await.map_err(|e| {
            DittoError::Internal(format!("failed to create execution directory: {}", e))
        })?;

        let mut args = self.config.args.clone();
        args.extend([
            "-VmHandle".to_string(),
            vm_handle.clone(),
            "-Mode".to_string(),
            request.mode.to_string(),
            "-Target".to_string(),
            request.target.trim().to_string(),
            "-OutputPath".to_string(),
            exec_dir.to_string_lossy().to_string(),
        ]);
        if let Some(numbers) = &request.test_numbers {
            args.push("-TestNumbers".to_string());
            args.push(numbers.clone());
        }
        let spec = ProcessSpec {
            program: self.config.program.clone(),
            args,
            work_dir: exec_dir.clone(),
            timeout: self.config.timeout,
            script: Some(self.config.script.clone()),
            artifact: ArtifactSpec::csv(self.config.artifact_name.clone()),
        };

        let job = EmulationJob::new(
            id.clone(),
            EmulationPhase::Preparing,
            "Preparing emulation environment...",
            EmulationDetail {
                deployment_id: request.deployment_id.clone(),
                mode: request.mode,
                target: request.target.clone(),
                test_numbers: request.test_numbers.clone(),
                vm_handle,
                exec_dir,
                result: None,
            },
        );
        let token = job.token.clone();
        self.registry.insert_new(job).await?;
        tracing::info!(
            job_id = %id,
            deployment_id = %request.deployment_id,
            mode = %request.mode,
            target = %request.target,
            "Emulation started"
        );

        let task = EmulationTask {
            id: id.clone(),
            deployment_id: request.deployment_id,
            registry: self.registry.clone(),
            runner: self.runner.clone(),
            spec,
            token,
        };
        let registry = self.registry.clone();
        let fault_id = id.clone();
        spawn_supervised("emulation", id.clone(), task.run(), move |msg| async move {
            registry.mutate(&fault_id, |job| job.fail(msg)).await;
        });

        Ok(id)
    }

    pub async fn status(&self, id: &str) -> Result<EmulationStatus> {
        self.registry
            .get(id)
            .await
            .map(|job| EmulationStatus::from(&job))
            .ok_or_else(|| DittoError::not_found("emulation", id))
    }

    pub async fn result(&self, id: &str) -> Result<EmulationResult> {
        let job = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| DittoError::not_found("emulation", id))?;
        job.detail
            .result
            .ok_or_else(|| DittoError::NotFound(format!("results not yet available for {}", id)))
    }

    /// Cancel a running execution and clean up the guest. Cleanup failures
    /// are logged only.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let vm_handle = self
            .registry
            .mutate(id, |job| {
                if job.cancel("Emulation cancelled by user") {
                    Ok(job.detail.vm_handle.clone())
                } else {
                    Err(DittoError::Conflict(format!(
                        "cannot cancel emulation in phase: {}",
                        job.phase()
                    )))
                }
            })
            .await
            .ok_or_else(|| DittoError::not_found("emulation", id))??;

        if let Err(e) = self
            .vms
            .exec_guest(&vm_handle, &self.config.cleanup_script)
            .await
        {
            tracing::warn!(job_id = %id, handle = %vm_handle, error = %e, "Cleanup after cancellation failed");
        }
        tracing::info!(job_id = %id, "Emulation cancelled");
        Ok(())
    }

    pub async fn list_all(&self) -> Vec<EmulationJob> {
        self.registry.list_all().await
    }

    pub async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let removed = self.registry.remove_older_than(max_age).await;
        for job in &removed {
            job.token.cancel();
            if let Err(e) = tokio::fs::remove_dir_all(&job.detail.exec_dir).await {
                tracing::warn!(job_id = %job.id, dir = %job.detail.exec_dir.display(), error = %e, "Failed to remove emulation output");
            }
        }
        removed.len()
    }
}

#[async_trait]
impl Retention for EmulationService {
    fn kind(&self) -> &'static str {
        "emulation"
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        EmulationService::cleanup_older_than(self, max_age).await
    }
}

struct EmulationTask {
    id: String,
    deployment_id: String,
    registry: Arc<JobRegistry<EmulationPhase, EmulationDetail>>,
    runner: ProcessRunner,
    spec: ProcessSpec,
    token: CancellationToken,
}

impl EmulationTask {
    async fn run(self) -> Result<()> {
        self.update(EmulationPhase::Running, 25.0, "Executing attack simulation...")
            .await;

        let artifact = tokio::select! {
            _ = self.token.cancelled() => {
                tracing::info!(job_id = %self.id, "Emulation task stopped");
                return Ok(());
            }
            outcome = self.runner.run(&self.spec) => {
                outcome.map_err(|e| e.context("Execution failed"))?
            }
        };

        self.update(EmulationPhase::Processing, 75.0, "Processing results...")
            .await;
        let content = tokio::fs::read(&artifact)
            .await
            .map_err(|e| DittoError::from(e).context("Failed to process results"))?;
        let (summary, records) =
            parse_results(&content).map_err(|e| e.context("Failed to process results"))?;

        let now = Utc::now();
        let result = EmulationResult {
            id: self.id.clone(),
            deploy_id: self.deployment_id.clone(),
            status: "completed".to_string(),
            summary,
            results: records,
            created_at: now,
            completed_at: now,
            error: String::new(),
        };

        self.registry
            .mutate(&self.id, |job| {
                if job.advance(
                    EmulationPhase::Completed,
                    100.0,
                    "Emulation completed successfully",
                ) {
                    job.detail.result = Some(result);
                }
            })
            .await;
        tracing::info!(
            job_id = %self.id,
            total = summary.total_tests,
            passed = summary.passed_tests,
            "Emulation finished"
        );
        Ok(())
    }

    async fn update(&self, phase: EmulationPhase, progress: f64, message: &str) {
        self.registry
            .mutate(&self.id, |job| job.advance(phase, progress, message))
            .await;
    }
}

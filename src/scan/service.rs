use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::error::{DittoError, Result};
use crate::jobs::{generate_id, JobPhase, JobRecord, JobRegistry, JobStatus};
use crate::process::{
    prepare_run_dir, ArtifactSpec, CommandRunner, ProcessRunner, ProcessSpec, ProgressEvent,
    ProgressSnapshot,
};
use crate::scan::model::ScanResult;
use crate::worker::{spawn_supervised, Retention};

const RUN_DIR_PREFIX: &str = "SecurityPosture";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Starting,
    Scanning,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanPhase::Starting => "starting",
            ScanPhase::Scanning => "scanning",
            ScanPhase::Processing => "processing",
            ScanPhase::Completed => "completed",
            ScanPhase::Error => "error",
            ScanPhase::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl JobPhase for ScanPhase {
    fn rank(&self) -> u8 {
        match self {
            ScanPhase::Starting => 0,
            ScanPhase::Scanning => 1,
            ScanPhase::Processing => 2,
            ScanPhase::Completed => 3,
            ScanPhase::Error | ScanPhase::Cancelled => u8::MAX,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanPhase::Completed | ScanPhase::Error | ScanPhase::Cancelled
        )
    }

    fn error() -> Self {
        ScanPhase::Error
    }

    fn cancelled() -> Self {
        ScanPhase::Cancelled
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(skip)]
    pub result: Option<ScanResult>,
}

pub type ScanJob = JobRecord<ScanPhase, ScanDetail>;

/// Decides whether the current process may run a scan.
#[async_trait]
pub trait PrivilegeProbe: Send + Sync {
    async fn is_privileged(&self) -> Result<bool>;
}

/// Runs the configured probe command. Privileged means a zero exit status and
/// output other than `False`.
pub struct CommandPrivilegeProbe {
    runner: Arc<dyn CommandRunner>,
    program: String,
    args: Vec<String>,
}

impl CommandPrivilegeProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &ScanConfig) -> Self {
        Self {
            runner,
            program: config.probe_program.clone(),
            args: config.probe_args.clone(),
        }
    }
}

#[async_trait]
impl PrivilegeProbe for CommandPrivilegeProbe {
    async fn is_privileged(&self) -> Result<bool> {
        let output = self.runner.run(&self.program, &self.args, None).await?;
        Ok(output.success() && !output.stdout.trim().eq_ignore_ascii_case("false"))
    }
}

/// Where a deployment gets its seed data from
#[async_trait]
pub trait ScanResultSource: Send + Sync {
    async fn scan_result(&self, scan_id: &str) -> Result<ScanResult>;
}

/// Host security scans.
///
/// `start` checks privileges, creates the job and returns its id at once; the
/// collector runs on a supervised task that mirrors its progress file into
/// the job (10% to 50%) and attaches the validated result on success.
pub struct ScanService {
    config: ScanConfig,
    registry: Arc<JobRegistry<ScanPhase, ScanDetail>>,
    runner: ProcessRunner,
    probe: Arc<dyn PrivilegeProbe>,
}

impl ScanService {
    pub fn new(config: ScanConfig, probe: Arc<dyn PrivilegeProbe>) -> Self {
        let runner = ProcessRunner::new(config.monitor_interval);
        Self {
            config,
            registry: Arc::new(JobRegistry::new()),
            runner,
            probe,
        }
    }

    /// Share an existing registry, e.g. one pre-populated by a caller.
    pub fn with_registry(mut self, registry: Arc<JobRegistry<ScanPhase, ScanDetail>>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry<ScanPhase, ScanDetail>> {
        &self.registry
    }

    pub async fn start(&self) -> Result<String> {
        match self.probe.is_privileged().await {
            Ok(true) => {}
            Ok(false) => return Err(DittoError::PrivilegeRequired),
            Err(e) => {
                tracing::warn!(error = %e, "Privilege probe failed");
                return Err(DittoError::PrivilegeRequired);
            }
        }

        let id = generate_id("scan");
        let work_dir = prepare_run_dir(&self.config.output_dir, RUN_DIR_PREFIX).await?;
        let spec = ProcessSpec {
            program: self.config.program.clone(),
            args: self.config.args.clone(),
            work_dir: work_dir.clone(),
            timeout: self.config.timeout,
            script: Some(self.config.script.clone()),
            artifact: ArtifactSpec::json(self.config.artifact_name.clone()),
        };

        let job = ScanJob::new(
            id.clone(),
            ScanPhase::Starting,
            "Initializing scan...",
            ScanDetail {
                output_dir: Some(work_dir),
                result: None,
            },
        );
        let token = job.token.clone();
        self.registry.insert_new(job).await?;
        tracing::info!(job_id = %id, "Scan started");

        let task = ScanTask {
            id: id.clone(),
            registry: self.registry.clone(),
            runner: self.runner.clone(),
            spec,
            token,
        };
        let registry = self.registry.clone();
        let fault_id = id.clone();
        spawn_supervised("scan", id.clone(), task.run(), move |msg| async move {
            registry.mutate(&fault_id, |job| job.fail(msg)).await;
        });

        Ok(id)
    }

    pub async fn status(&self, id: &str) -> Result<JobStatus<ScanPhase>> {
        self.registry
            .get(id)
            .await
            .map(|job| job.status)
            .ok_or_else(|| DittoError::not_found("scan", id))
    }

    pub async fn result(&self, id: &str) -> Result<ScanResult> {
        let job = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| DittoError::not_found("scan", id))?;
        job.detail
            .result
            .ok_or_else(|| DittoError::not_found("scan result", id))
    }

    /// Only a scan that has not reached a terminal phase can be cancelled.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.registry
            .mutate(id, |job| {
                if job.cancel("Scan cancelled by user") {
                    Ok(())
                } else {
                    Err(DittoError::Conflict(format!(
                        "cannot cancel scan in phase: {}",
                        job.phase()
                    )))
                }
            })
            .await
            .ok_or_else(|| DittoError::not_found("scan", id))??;
        tracing::info!(job_id = %id, "Scan cancelled");
        Ok(())
    }

    pub async fn list_all(&self) -> Vec<ScanJob> {
        self.registry.list_all().await
    }

    /// Register a result produced elsewhere (an earlier run's artifact) as a
    /// completed scan so it can seed a deployment.
    pub async fn import_result(&self, mut result: ScanResult) -> Result<String> {
        result.validate()?;
        let id = generate_id("scan");
        result.id = id.clone();
        result.created_at = Utc::now();

        let mut job = ScanJob::new(id.clone(), ScanPhase::Starting, "", ScanDetail::default());
        job.advance(ScanPhase::Completed, 100.0, "Scan imported");
        job.detail.result = Some(result);
        self.registry.insert_new(job).await?;
        tracing::info!(job_id = %id, "Scan result imported");
        Ok(id)
    }

    pub async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let removed = self.registry.remove_older_than(max_age).await;
        for job in &removed {
            job.token.cancel();
            if let Some(dir) = &job.detail.output_dir {
                if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                    tracing::warn!(job_id = %job.id, dir = %dir.display(), error = %e, "Failed to remove scan output");
                }
            }
        }
        removed.len()
    }
}

#[async_trait]
impl ScanResultSource for ScanService {
    async fn scan_result(&self, scan_id: &str) -> Result<ScanResult> {
        self.result(scan_id).await
    }
}

#[async_trait]
impl Retention for ScanService {
    fn kind(&self) -> &'static str {
        "scan"
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        ScanService::cleanup_older_than(self, max_age).await
    }
}

struct ScanTask {
    id: String,
    registry: Arc<JobRegistry<ScanPhase, ScanDetail>>,
    runner: ProcessRunner,
    spec: ProcessSpec,
    token: CancellationToken,
}

impl ScanTask {
    async fn run(self) -> Result<()> {
        self.update(ScanPhase::Scanning, 10.0, "Running system scan...")
            .await;

        let (tx, mut rx) = mpsc::channel(16);
        let collect = self.runner.run_monitored(&self.spec, tx);
        let mirror = async {
            while let Some(event) = rx.recv().await {
                match event {
                    ProgressEvent::Progress(snapshot) => {
                        let (progress, message) = scan_progress(&snapshot);
                        self.update(ScanPhase::Scanning, progress, message).await;
                    }
                    ProgressEvent::Log(log) => {
                        tracing::debug!(job_id = %self.id, bytes = log.len(), "Scan log updated");
                    }
                }
            }
        };

        let artifact = tokio::select! {
            _ = self.token.cancelled() => {
                tracing::info!(job_id = %self.id, "Scan task stopped");
                return Ok(());
            }
            (outcome, ()) = async { tokio::join!(collect, mirror) } => {
                outcome.map_err(|e| e.context("Scan failed"))?
            }
        };

        self.update(ScanPhase::Processing, 50.0, "Processing scan results...")
            .await;
        let mut result = ScanResult::from_file(&artifact)
            .await
            .map_err(|e| e.context("Failed to process results"))?;
        result.id = self.id.clone();
        result.created_at = Utc::now();

        let attached = self
            .registry
            .mutate(&self.id, |job| {
                if job.advance(ScanPhase::Completed, 100.0, "Scan completed successfully") {
                    job.detail.result = Some(result);
                    true
                } else {
                    false
                }
            })
            .await
            .unwrap_or(false);

        if attached {
            tracing::info!(job_id = %self.id, "Scan completed");
        }
        Ok(())
    }

    async fn update(&self, phase: ScanPhase, progress: f64, message: impl Into<String>) {
        let message = message.into();
        self.registry
            .mutate(&self.id, |job| job.advance(phase, progress, message))
            .await;
    }
}

/// Collector progress (0..=100) mapped into the scanning band (10..=50).
fn scan_progress(snapshot: &ProgressSnapshot) -> (f64, String) {
    let progress = 10.0 + f64::from(snapshot.progress.min(100)) * 0.4;
    let message = if snapshot.status.is_empty() {
        snapshot.stage.clone()
    } else if snapshot.stage.is_empty() {
        snapshot.status.clone()
    } else {
        format!("{}: {}", snapshot.stage, snapshot.status)
    };
    (progress, message)
}

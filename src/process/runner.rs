use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DittoError, Result};
use crate::process::progress::{ProgressEvent, ProgressMonitor};
use crate::process::strip_bom;

/// Placeholder in [`ProcessSpec::args`] replaced with the per-run script copy
pub const SCRIPT_PLACEHOLDER: &str = "{script}";

/// Captured stdout/stderr beyond this many bytes is discarded
pub const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Json,
    Csv,
}

/// The file a run must leave behind in its work directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub file_name: String,
    pub format: ArtifactFormat,
}

impl ArtifactSpec {
    pub fn json(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            format: ArtifactFormat::Json,
        }
    }

    pub fn csv(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            format: ArtifactFormat::Csv,
        }
    }
}

/// One invocation of an external tool
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Existing directory owned by this run
    pub work_dir: PathBuf,
    pub timeout: Duration,
    /// Script copied into `work_dir` before the run
    pub script: Option<PathBuf>,
    pub artifact: ArtifactSpec,
}

impl ProcessSpec {
    fn resolved_args(&self, script: Option<&Path>) -> Vec<String> {
        let script = script.map(|p| p.to_string_lossy().to_string());
        self.args
            .iter()
            .map(|arg| match (&script, arg.as_str()) {
                (Some(path), SCRIPT_PLACEHOLDER) => path.clone(),
                _ => arg.clone(),
            })
            .collect()
    }
}

/// Create `<base>/<prefix>_<timestamp>` for a new run.
pub async fn prepare_run_dir(base: &Path, prefix: &str) -> Result<PathBuf> {
    let now = Utc::now();
    let name = format!(
        "{}_{}_{:09}",
        prefix,
        now.format("%Y%m%d_%H%M%S"),
        now.timestamp_subsec_nanos()
    );
    let dir = base.join(name);
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

/// Launches external tools and validates what they leave behind.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    monitor_interval: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl ProcessRunner {
    pub fn new(monitor_interval: Duration) -> Self {
        Self { monitor_interval }
    }

    /// Run to completion and return the path of the validated artifact.
    pub async fn run(&self, spec: &ProcessSpec) -> Result<PathBuf> {
        self.execute(spec, None).await
    }

    /// Like [`ProcessRunner::run`], additionally forwarding changed progress
    /// snapshots and log contents from the run directory while the process is
    /// alive. The channel closes when the run ends.
    pub async fn run_monitored(
        &self,
        spec: &ProcessSpec,
        progress: mpsc::Sender<ProgressEvent>,
    ) -> Result<PathBuf> {
        self.execute(spec, Some(progress)).await
    }

    async fn execute(
        &self,
        spec: &ProcessSpec,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<PathBuf> {
        let script_copy = match &spec.script {
            Some(script) => Some(copy_script(script, &spec.work_dir).await?),
            None => None,
        };
        let args = spec.resolved_args(script_copy.as_deref());

        tracing::info!(
            program = %spec.program,
            work_dir = %spec.work_dir.display(),
            timeout_secs = spec.timeout.as_secs(),
            "Starting external process"
        );

        let mut command = Command::new(&spec.program);
        command
            .args(&args)
            .current_dir(&spec.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let deadline = Instant::now() + spec.timeout;
        let mut child = command.spawn().map_err(|e| {
            DittoError::ExternalTool(format!("failed to start {}: {}", spec.program, e))
        })?;
        // Helpers the tool leaves behind share its group and die with the run.
        let group = ProcessGroup(child.id());

        let mut stdout = child.stdout.take().map(|s| tokio::spawn(drain(s)));
        let mut stderr = child.stderr.take().map(|s| tokio::spawn(drain(s)));

        let stop_monitor = CancellationToken::new();
        // Stops the monitor even when this future is dropped mid-run.
        let _monitor_guard = stop_monitor.clone().drop_guard();
        let monitor = progress.map(|tx| {
            let monitor = ProgressMonitor::new(spec.work_dir.clone(), self.monitor_interval);
            tokio::spawn(monitor.run(tx, stop_monitor.clone()))
        });

        // The deadline covers the exit and both pipes reaching EOF.
        let outcome = tokio::time::timeout_at(deadline, async {
            let status = child.wait().await;
            let out = collect(stdout.as_mut()).await;
            let err = collect(stderr.as_mut()).await;
            (status, out, err)
        })
        .await;

        stop_monitor.cancel();
        if let Some(handle) = monitor {
            let _ = handle.await;
        }

        let (status, stdout, stderr) = match outcome {
            Ok((status, out, err)) => {
                let status = status.map_err(|e| {
                    DittoError::ExternalTool(format!("failed to wait for {}: {}", spec.program, e))
                })?;
                (status, out, err)
            }
            Err(_) => {
                for handle in stdout.iter().chain(stderr.iter()) {
                    handle.abort();
                }
                drop(group);
                if let Err(e) = child.kill().await {
                    tracing::debug!(program = %spec.program, error = %e, "Timed out process already exited");
                }
                tracing::warn!(program = %spec.program, "External process timed out");
                return Err(DittoError::Timeout(format!(
                    "{} timed out after {} seconds",
                    spec.program,
                    spec.timeout.as_secs()
                )));
            }
        };

        if !status.success() {
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            tracing::warn!(program = %spec.program, exit_code = ?status.code(), "External process failed");
            return Err(DittoError::ExternalTool(format!(
                "script execution failed (exit code {:?}): {}",
                status.code(),
                detail
            )));
        }

        let artifact = spec.work_dir.join(&spec.artifact.file_name);
        validate_artifact(&artifact, spec.artifact.format).await?;

        tracing::info!(artifact = %artifact.display(), "External process completed");
        Ok(artifact)
    }
}

async fn copy_script(script: &Path, work_dir: &Path) -> Result<PathBuf> {
    let file_name = script.file_name().ok_or_else(|| {
        DittoError::Validation(format!("script path has no file name: {}", script.display()))
    })?;
    let target = work_dir.join(file_name);
    tokio::fs::copy(script, &target).await.map_err(|e| {
        DittoError::ExternalTool(format!("failed to copy script {}: {}", script.display(), e))
    })?;
    Ok(target)
}

/// Kills whatever is left in a run's process group when dropped
struct ProcessGroup(Option<u32>);

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.0 {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // ESRCH just means the group is already gone
    let _ = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Read a stream to EOF, keeping at most [`MAX_OUTPUT_BYTES`].
async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let _ = (&mut reader)
        .take(MAX_OUTPUT_BYTES as u64)
        .read_to_end(&mut buf)
        .await;
    // Keep the pipe flowing so a chatty tool never blocks on a full buffer
    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
    String::from_utf8_lossy(&buf).to_string()
}

async fn collect(handle: Option<&mut JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Check that `path` exists and parses as `format`.
pub async fn validate_artifact(path: &Path, format: ArtifactFormat) -> Result<()> {
    let content = tokio::fs::read(path).await.map_err(|e| {
        DittoError::ExternalTool(format!("output file not found at {}: {}", path.display(), e))
    })?;
    let content = strip_bom(&content);

    match format {
        ArtifactFormat::Json => {
            serde_json::from_slice::<serde_json::Value>(content).map_err(|e| {
                DittoError::ExternalTool(format!("invalid results format: {}", e))
            })?;
        }
        ArtifactFormat::Csv => {
            let mut reader = csv::ReaderBuilder::new()
                .flexible(true)
                .from_reader(content);
            let headers = reader
                .headers()
                .map_err(|e| DittoError::ExternalTool(format!("invalid results format: {}", e)))?;
            if headers.is_empty() {
                return Err(DittoError::ExternalTool(
                    "invalid results format: missing header row".to_string(),
                ));
            }
            for record in reader.records() {
                record.map_err(|e| {
                    DittoError::ExternalTool(format!("invalid results format: {}", e))
                })?;
            }
        }
    }
    Ok(())
}

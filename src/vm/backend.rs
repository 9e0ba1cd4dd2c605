use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{DittoError, Result};
use crate::process::CommandRunner;
use crate::vm::state::{parse_hypervisor_state, CanonicalState, StatusLineParser};

/// What a backend needs to locate one instance
#[derive(Debug, Clone)]
pub struct VmInstance {
    pub handle: String,
    /// Name registered with the hypervisor (`<prefix>_<handle>`)
    pub name: String,
    pub dir: PathBuf,
}

/// One source of truth for VM state.
#[async_trait]
pub trait StatusBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(Unknown)` means the backend answered but the answer was not
    /// recognised; `Err` means the backend could not be asked at all.
    async fn query(&self, instance: &VmInstance) -> Result<CanonicalState>;
}

/// Direct hypervisor lookup by instance name
pub struct HypervisorCli {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl HypervisorCli {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }
}

#[async_trait]
impl StatusBackend for HypervisorCli {
    fn name(&self) -> &'static str {
        "hypervisor"
    }

    async fn query(&self, instance: &VmInstance) -> Result<CanonicalState> {
        let args = vec![
            "showvminfo".to_string(),
            instance.name.clone(),
            "--machinereadable".to_string(),
        ];
        let output = self
            .runner
            .run(&self.program, &args, None)
            .await?
            .check("showvminfo")?;
        Ok(parse_hypervisor_state(&output.stdout))
    }
}

/// Provisioning-tool status, scraped from its human-readable output
pub struct ProvisionerCli {
    runner: Arc<dyn CommandRunner>,
    program: String,
    parser: Arc<dyn StatusLineParser>,
}

impl ProvisionerCli {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        program: impl Into<String>,
        parser: Arc<dyn StatusLineParser>,
    ) -> Self {
        Self {
            runner,
            program: program.into(),
            parser,
        }
    }
}

#[async_trait]
impl StatusBackend for ProvisionerCli {
    fn name(&self) -> &'static str {
        "provisioner"
    }

    async fn query(&self, instance: &VmInstance) -> Result<CanonicalState> {
        let local = self
            .runner
            .run(&self.program, &["status".to_string()], Some(&instance.dir))
            .await
            .and_then(|out| out.check("status"));

        let output = match local {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(handle = %instance.handle, error = %e, "Local status failed, trying global status");
                self.runner
                    .run(
                        &self.program,
                        &["global-status".to_string(), "--prune".to_string()],
                        None,
                    )
                    .await?
                    .check("global-status")?
            }
        };

        Ok(self.parser.parse(&output.combined(), &instance.handle))
    }
}

/// Ordered list of status backends.
///
/// The first backend that returns a recognised state wins. `Unknown` answers
/// and errors fall through to the next backend. If at least one backend
/// answered, the result is `Unknown`; if every backend failed, the last error
/// is returned.
pub struct StateResolver {
    backends: Vec<Arc<dyn StatusBackend>>,
}

impl StateResolver {
    pub fn new(backends: Vec<Arc<dyn StatusBackend>>) -> Self {
        Self { backends }
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub async fn resolve(&self, instance: &VmInstance) -> Result<CanonicalState> {
        let mut answered = false;
        let mut last_error = None;

        for backend in &self.backends {
            match backend.query(instance).await {
                Ok(CanonicalState::Unknown) => {
                    tracing::debug!(handle = %instance.handle, backend = backend.name(), "Unrecognised VM state");
                    answered = true;
                }
                Ok(state) => {
                    tracing::debug!(handle = %instance.handle, backend = backend.name(), state = %state, "VM state resolved");
                    return Ok(state);
                }
                Err(e) => {
                    tracing::debug!(handle = %instance.handle, backend = backend.name(), error = %e, "Status backend failed");
                    last_error = Some(e);
                }
            }
        }

        if answered {
            return Ok(CanonicalState::Unknown);
        }
        Err(last_error.unwrap_or_else(|| {
            DittoError::Internal("no VM status backends configured".to_string())
        }))
    }
}

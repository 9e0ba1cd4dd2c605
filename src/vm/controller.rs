use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::VmConfig;
use crate::error::{DittoError, Result};
use crate::jobs::unique_nanos;
use crate::process::CommandRunner;
use crate::vm::backend::{HypervisorCli, ProvisionerCli, StateResolver, StatusBackend, VmInstance};
use crate::vm::descriptor::{
    render_descriptor, VmMetadata, DESCRIPTOR_FILE, METADATA_FILE, SEED_FILE,
};
use crate::vm::state::{CanonicalState, SubstringStatusParser};
use crate::vm::{VmLifecycle, VmSeed};

/// Listing entry for one known instance
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    pub id: String,
    pub name: String,
    pub status: CanonicalState,
    pub created_at: Option<DateTime<Utc>>,
    pub scan_id: String,
}

/// Manages VM instances through a hypervisor CLI with a provisioning-tool
/// fallback.
///
/// Each instance owns `<base_dir>/<handle>/` holding its descriptor, seed data
/// and metadata. The handle map is rebuilt from those directories on startup;
/// VM state itself is never cached and always queried live.
pub struct VmController {
    config: VmConfig,
    runner: Arc<dyn CommandRunner>,
    resolver: StateResolver,
    instances: RwLock<HashMap<String, PathBuf>>,
}

impl VmController {
    /// Create a controller using the default backend order: hypervisor first,
    /// provisioning tool second.
    pub async fn new(config: VmConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let backends: Vec<Arc<dyn StatusBackend>> = vec![
            Arc::new(HypervisorCli::new(runner.clone(), config.hypervisor_cli.clone())),
            Arc::new(ProvisionerCli::new(
                runner.clone(),
                config.provisioner_cli.clone(),
                Arc::new(SubstringStatusParser::default()),
            )),
        ];
        Self::with_resolver(config, runner, StateResolver::new(backends)).await
    }

    pub async fn with_resolver(
        config: VmConfig,
        runner: Arc<dyn CommandRunner>,
        resolver: StateResolver,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.base_dir).await?;
        let instances = discover_instances(&config.base_dir).await?;

        tracing::info!(
            base_dir = %config.base_dir.display(),
            known_instances = instances.len(),
            backends = ?resolver.backend_names(),
            "VM controller initialised"
        );

        Ok(Self {
            config,
            runner,
            resolver,
            instances: RwLock::new(instances),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub async fn contains(&self, handle: &str) -> bool {
        self.instances.read().await.contains_key(handle)
    }

    pub async fn handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.instances.read().await.keys().cloned().collect();
        handles.sort();
        handles
    }

    async fn instance(&self, handle: &str) -> Result<VmInstance> {
        let dir = self
            .instances
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| DittoError::not_found("VM", handle))?;
        Ok(VmInstance {
            handle: handle.to_string(),
            name: self.config.instance_name(handle),
            dir,
        })
    }

    async fn hypervisor(&self, args: &[&str]) -> Result<()> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner
            .run(&self.config.hypervisor_cli, &args, None)
            .await?
            .check(&format!("{} {}", self.config.hypervisor_cli, args.join(" ")))?;
        Ok(())
    }

    async fn provisioner(&self, args: &[&str], dir: &Path) -> Result<()> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner
            .run(&self.config.provisioner_cli, &args, Some(dir))
            .await?
            .check(&format!("{} {}", self.config.provisioner_cli, args.join(" ")))?;
        Ok(())
    }

    /// All known instances with their metadata and live state
    pub async fn list(&self) -> Vec<VmInfo> {
        let instances: Vec<(String, PathBuf)> = self
            .instances
            .read()
            .await
            .iter()
            .map(|(h, d)| (h.clone(), d.clone()))
            .collect();

        let mut infos = Vec::with_capacity(instances.len());
        for (handle, dir) in instances {
            let metadata = read_metadata(&dir).await;
            let status = self.status(&handle).await.unwrap_or(CanonicalState::Unknown);
            infos.push(VmInfo {
                name: self.config.instance_name(&handle),
                id: handle,
                status,
                created_at: metadata.as_ref().map(|m| m.created_at),
                scan_id: metadata.map(|m| m.scan_id).unwrap_or_default(),
            });
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    async fn write_instance_files(&self, dir: &Path, handle: &str, seed: &VmSeed) -> Result<()> {
        let metadata = VmMetadata {
            created_at: Utc::now(),
            scan_id: seed.scan_id.clone(),
            deployment_id: seed.deployment_id.clone(),
        };
        tokio::fs::write(dir.join(METADATA_FILE), serde_json::to_vec(&metadata)?).await?;
        tokio::fs::write(
            dir.join(DESCRIPTOR_FILE),
            render_descriptor(&self.config, handle),
        )
        .await?;
        tokio::fs::write(dir.join(SEED_FILE), serde_json::to_vec(&seed.data)?).await?;
        Ok(())
    }

    async fn forget(&self, handle: &str, dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            tracing::warn!(handle, dir = %dir.display(), error = %e, "Failed to remove VM directory");
        }
        self.instances.write().await.remove(handle);
    }
}

#[async_trait]
impl VmLifecycle for VmController {
    async fn create(&self, seed: &VmSeed) -> Result<String> {
        let handle = format!("vm_{}", unique_nanos());
        let dir = self.config.base_dir.join(&handle);
        tokio::fs::create_dir_all(&dir).await?;
        self.instances
            .write()
            .await
            .insert(handle.clone(), dir.clone());

        if let Err(e) = self.write_instance_files(&dir, &handle, seed).await {
            self.forget(&handle, &dir).await;
            return Err(e);
        }

        tracing::info!(handle = %handle, dir = %dir.display(), "Provisioning VM");
        if let Err(e) = self.provisioner(&["up"], &dir).await {
            tracing::error!(handle = %handle, error = %e, "Provisioning failed");
            self.forget(&handle, &dir).await;
            return Err(e);
        }

        match self.status(&handle).await {
            Ok(CanonicalState::Running) => {}
            Ok(state) => tracing::warn!(handle = %handle, state = %state, "VM not running after provisioning"),
            Err(e) => tracing::warn!(handle = %handle, error = %e, "Initial VM status check failed"),
        }

        tracing::info!(handle = %handle, "VM created");
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> Result<()> {
        let instance = self.instance(handle).await?;
        if let Err(e) = self
            .hypervisor(&["startvm", &instance.name, "--type", "headless"])
            .await
        {
            tracing::debug!(handle, error = %e, "Hypervisor start failed, falling back to provisioner");
            self.provisioner(&["up"], &instance.dir).await?;
        }
        tracing::info!(handle, "VM started");
        Ok(())
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        let instance = self.instance(handle).await?;
        if let Err(e) = self
            .hypervisor(&["controlvm", &instance.name, "poweroff"])
            .await
        {
            tracing::debug!(handle, error = %e, "Hypervisor stop failed, falling back to provisioner");
            self.provisioner(&["halt", "-f"], &instance.dir).await?;
        }
        tracing::info!(handle, "VM stopped");
        Ok(())
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        let instance = self.instance(handle).await?;
        if let Err(e) = self
            .hypervisor(&["unregistervm", &instance.name, "--delete"])
            .await
        {
            tracing::debug!(handle, error = %e, "Hypervisor destroy failed, falling back to provisioner");
            self.provisioner(&["destroy", "-f"], &instance.dir).await?;
        }
        self.forget(handle, &instance.dir).await;
        tracing::info!(handle, "VM destroyed");
        Ok(())
    }

    async fn status(&self, handle: &str) -> Result<CanonicalState> {
        let instance = self.instance(handle).await?;
        self.resolver.resolve(&instance).await
    }

    async fn exec_guest(&self, handle: &str, script: &str) -> Result<()> {
        let instance = self.instance(handle).await?;
        self.provisioner(&["powershell", "-c", script], &instance.dir)
            .await
    }
}

/// Every sub-directory of `base_dir` holding a descriptor is a known instance.
async fn discover_instances(base_dir: &Path) -> Result<HashMap<String, PathBuf>> {
    let mut instances = HashMap::new();
    let mut entries = tokio::fs::read_dir(base_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let dir = entry.path();
        if tokio::fs::try_exists(dir.join(DESCRIPTOR_FILE))
            .await
            .unwrap_or(false)
        {
            let handle = entry.file_name().to_string_lossy().to_string();
            tracing::debug!(handle = %handle, dir = %dir.display(), "Found existing VM");
            instances.insert(handle, dir);
        }
    }
    Ok(instances)
}

async fn read_metadata(dir: &Path) -> Option<VmMetadata> {
    let content = tokio::fs::read(dir.join(METADATA_FILE)).await.ok()?;
    serde_json::from_slice(&content).ok()
}

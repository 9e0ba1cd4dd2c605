use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for the host security scan.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Interpreter used to run the collector script
    pub program: String,
    /// Arguments passed to `program`. `{script}` is replaced with the path of
    /// the per-run copy of `script`.
    pub args: Vec<String>,
    /// Collector script, copied into every run directory
    pub script: PathBuf,
    /// Directory holding one `SecurityPosture_*` directory per run
    pub output_dir: PathBuf,
    /// Artifact the collector must leave in its run directory
    pub artifact_name: String,
    pub timeout: Duration,
    pub monitor_interval: Duration,
    /// Privilege probe. The scan is refused unless it exits successfully and
    /// does not print `False`.
    pub probe_program: String,
    pub probe_args: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            program: "powershell.exe".to_string(),
            args: [
                "-WindowStyle",
                "Hidden",
                "-NoProfile",
                "-ExecutionPolicy",
                "Bypass",
                "-NonInteractive",
                "-NoLogo",
                "-File",
                "{script}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            script: PathBuf::from("scripts/config_collector.ps1"),
            output_dir: PathBuf::from("output"),
            artifact_name: "security_posture.json".to_string(),
            timeout: Duration::from_secs(5 * 60),
            monitor_interval: Duration::from_millis(500),
            probe_program: "powershell.exe".to_string(),
            probe_args: vec![
                "-WindowStyle".to_string(),
                "Hidden".to_string(),
                "-Command".to_string(),
                "[Security.Principal.WindowsIdentity]::GetCurrent().Groups -contains 'S-1-5-32-544'"
                    .to_string(),
            ],
        }
    }
}

/// Settings for the VM controller and the CLIs it drives.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Directory holding one sub-directory per VM instance
    pub base_dir: PathBuf,
    pub hypervisor_cli: String,
    pub provisioner_cli: String,
    /// Instances are named `<name_prefix>_<handle>` in the hypervisor
    pub name_prefix: String,
    pub box_name: String,
    pub box_version: String,
    pub memory_mb: u32,
    pub cpus: u32,
    pub gui: bool,
    /// Interval between status polls while waiting for a new VM
    pub poll_interval: Duration,
    pub poll_retries: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("vagrant"),
            hypervisor_cli: "VBoxManage".to_string(),
            provisioner_cli: "vagrant".to_string(),
            name_prefix: "CyberDitto".to_string(),
            box_name: "StefanScherer/windows_11".to_string(),
            box_version: "2021.12.09".to_string(),
            memory_mb: 4096,
            cpus: 2,
            gui: true,
            poll_interval: Duration::from_secs(5),
            poll_retries: 60,
        }
    }
}

impl VmConfig {
    pub fn instance_name(&self, handle: &str) -> String {
        format!("{}_{}", self.name_prefix, handle)
    }
}

/// Settings for the adversary-emulation test runner.
#[derive(Debug, Clone)]
pub struct EmulationConfig {
    pub program: String,
    /// Arguments passed before the per-execution ones (`-VmHandle`, `-Mode`, ...)
    pub args: Vec<String>,
    pub script: PathBuf,
    /// Directory holding one sub-directory per execution
    pub results_dir: PathBuf,
    pub artifact_name: String,
    pub timeout: Duration,
    /// Guest script run on cancellation to stop test processes and remove staged files
    pub cleanup_script: String,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            program: "powershell.exe".to_string(),
            args: vec![
                "-NoProfile".to_string(),
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-File".to_string(),
                "{script}".to_string(),
            ],
            script: PathBuf::from("scripts/atomic_runner.ps1"),
            results_dir: PathBuf::from("emulation_results"),
            artifact_name: "atomic_results.csv".to_string(),
            timeout: Duration::from_secs(30 * 60),
            cleanup_script: "Get-Process | Where-Object {$_.Name -like '*atomic*'} | Stop-Process -Force; \
                             Remove-Item -Path 'C:\\AtomicScripts\\*' -Force -ErrorAction SilentlyContinue"
                .to_string(),
        }
    }
}

/// Retention sweep schedule.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub max_age: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(10 * 60),
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DittoConfig {
    pub project_root: PathBuf,
    pub scan: ScanConfig,
    pub vm: VmConfig,
    pub emulation: EmulationConfig,
}

impl Default for DittoConfig {
    fn default() -> Self {
        Self::new(".")
    }
}

impl DittoConfig {
    /// Build a config whose relative paths all live under `project_root`.
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        let root = project_root.as_ref().to_path_buf();
        let mut scan = ScanConfig::default();
        scan.script = root.join(&scan.script);
        scan.output_dir = root.join(&scan.output_dir);

        let mut vm = VmConfig::default();
        vm.base_dir = root.join(&vm.base_dir);

        let mut emulation = EmulationConfig::default();
        emulation.script = root.join(&emulation.script);
        emulation.results_dir = root.join(&emulation.results_dir);

        Self {
            project_root: root,
            scan,
            vm,
            emulation,
        }
    }

    pub fn with_vm(mut self, vm: VmConfig) -> Self {
        self.vm = vm;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_config_default() {
        let cfg = ScanConfig::default();
        assert_eq!(cfg.artifact_name, "security_posture.json");
        assert_eq!(cfg.timeout, Duration::from_secs(300));
        assert_eq!(cfg.monitor_interval, Duration::from_millis(500));
        assert!(cfg.args.iter().any(|a| a == "{script}"));
    }

    #[test]
    fn vm_config_default() {
        let cfg = VmConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.poll_retries, 60);
        assert_eq!(cfg.instance_name("vm_1"), "CyberDitto_vm_1");
    }

    #[test]
    fn retention_disabled_by_default() {
        let cfg = RetentionConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.max_age, Duration::from_secs(86_400));
    }

    #[test]
    fn ditto_config_resolves_paths_under_root() {
        let cfg = DittoConfig::new("/srv/ditto");
        assert_eq!(cfg.project_root, PathBuf::from("/srv/ditto"));
        assert_eq!(cfg.scan.output_dir, PathBuf::from("/srv/ditto/output"));
        assert_eq!(
            cfg.scan.script,
            PathBuf::from("/srv/ditto/scripts/config_collector.ps1")
        );
        assert_eq!(cfg.vm.base_dir, PathBuf::from("/srv/ditto/vagrant"));
        assert_eq!(
            cfg.emulation.results_dir,
            PathBuf::from("/srv/ditto/emulation_results")
        );
    }

    #[test]
    fn ditto_config_builders_replace_sections() {
        let vm = VmConfig {
            poll_retries: 3,
            ..VmConfig::default()
        };
        let cfg = DittoConfig::new("/tmp").with_vm(vm);
        assert_eq!(cfg.vm.poll_retries, 3);
    }
}

//! Test harness for orchestration integration tests.
//!
//! Provides scripted stand-ins for the external CLIs and the VM controller,
//! plus helpers that build configs pointing at throwaway directories and
//! shell scripts that play the role of the collector and the test runner.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use cyberditto::config::{EmulationConfig, ScanConfig, VmConfig};
use cyberditto::error::{DittoError, Result};
use cyberditto::process::{CommandOutput, CommandRunner};
use cyberditto::scan::{PrivilegeProbe, ScanResult, ScanResultSource};
use cyberditto::vm::{CanonicalState, VmLifecycle, VmSeed};

// ============================================================================
// External CLIs
// ============================================================================

/// One invocation seen by [`FakeCommandRunner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl RecordedCall {
    pub fn line(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

type Handler = dyn Fn(&str, &[String]) -> CommandOutput + Send + Sync;

/// [`CommandRunner`] that answers from a closure and records every call
pub struct FakeCommandRunner {
    calls: Mutex<Vec<RecordedCall>>,
    handler: Box<Handler>,
}

impl FakeCommandRunner {
    pub fn new(
        handler: impl Fn(&str, &[String]) -> CommandOutput + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        })
    }

    /// Every command succeeds with empty output
    pub fn always_ok() -> Arc<Self> {
        Self::new(|_, _| ok(""))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    /// True if some call's program and arguments start with `prefix`
    pub fn saw(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.line().starts_with(prefix))
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: cwd.map(Path::to_path_buf),
        });
        Ok((self.handler)(program, args))
    }
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

// ============================================================================
// VM lifecycle
// ============================================================================

/// Scripted [`VmLifecycle`].
///
/// `status` pops queued answers first and then keeps returning the fallback
/// state. Handles it never created (or already destroyed) are `NotFound`.
pub struct FakeVms {
    queued: Mutex<VecDeque<CanonicalState>>,
    state: Mutex<CanonicalState>,
    known: Mutex<HashSet<String>>,
    guest_scripts: Mutex<Vec<(String, String)>>,
    create_delay: Mutex<Duration>,
    pub creates: AtomicUsize,
    pub destroys: AtomicUsize,
    pub create_fails: AtomicBool,
    pub destroy_fails: AtomicBool,
}

impl FakeVms {
    pub fn new(state: CanonicalState) -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(VecDeque::new()),
            state: Mutex::new(state),
            known: Mutex::new(HashSet::new()),
            guest_scripts: Mutex::new(Vec::new()),
            create_delay: Mutex::new(Duration::ZERO),
            creates: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
            create_fails: AtomicBool::new(false),
            destroy_fails: AtomicBool::new(false),
        })
    }

    pub fn set_state(&self, state: CanonicalState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn queue(&self, states: &[CanonicalState]) {
        self.queued.lock().unwrap().extend(states.iter().copied());
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    /// Make `handle` known without going through `create`
    pub fn register(&self, handle: &str) {
        self.known.lock().unwrap().insert(handle.to_string());
    }

    pub fn is_known(&self, handle: &str) -> bool {
        self.known.lock().unwrap().contains(handle)
    }

    pub fn guest_scripts(&self) -> Vec<(String, String)> {
        self.guest_scripts.lock().unwrap().clone()
    }

    pub fn destroy_count(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    fn require(&self, handle: &str) -> Result<()> {
        if self.is_known(handle) {
            Ok(())
        } else {
            Err(DittoError::not_found("VM", handle))
        }
    }
}

#[async_trait]
impl VmLifecycle for FakeVms {
    async fn create(&self, seed: &VmSeed) -> Result<String> {
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.create_fails.load(Ordering::SeqCst) {
            return Err(DittoError::ExternalTool("vagrant up failed".to_string()));
        }
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = format!("vm_{}_{}", seed.deployment_id, n);
        self.register(&handle);
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> Result<()> {
        self.require(handle)?;
        self.set_state(CanonicalState::Running);
        Ok(())
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        self.require(handle)?;
        self.set_state(CanonicalState::Stopped);
        Ok(())
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        self.require(handle)?;
        self.destroys.fetch_add(1, Ordering::SeqCst);
        if self.destroy_fails.load(Ordering::SeqCst) {
            return Err(DittoError::ExternalTool("unregistervm failed".to_string()));
        }
        self.known.lock().unwrap().remove(handle);
        Ok(())
    }

    async fn status(&self, handle: &str) -> Result<CanonicalState> {
        self.require(handle)?;
        if let Some(state) = self.queued.lock().unwrap().pop_front() {
            return Ok(state);
        }
        Ok(*self.state.lock().unwrap())
    }

    async fn exec_guest(&self, handle: &str, script: &str) -> Result<()> {
        self.require(handle)?;
        self.guest_scripts
            .lock()
            .unwrap()
            .push((handle.to_string(), script.to_string()));
        Ok(())
    }
}

// ============================================================================
// Scan collaborators
// ============================================================================

pub struct FixedProbe(pub bool);

#[async_trait]
impl PrivilegeProbe for FixedProbe {
    async fn is_privileged(&self) -> Result<bool> {
        Ok(self.0)
    }
}

/// Scan results keyed by scan id
#[derive(Default)]
pub struct StaticScans {
    results: Mutex<HashMap<String, ScanResult>>,
}

impl StaticScans {
    pub fn with(scan_id: &str, result: ScanResult) -> Arc<Self> {
        let scans = Self::default();
        scans
            .results
            .lock()
            .unwrap()
            .insert(scan_id.to_string(), result);
        Arc::new(scans)
    }
}

#[async_trait]
impl ScanResultSource for StaticScans {
    async fn scan_result(&self, scan_id: &str) -> Result<ScanResult> {
        self.results
            .lock()
            .unwrap()
            .get(scan_id)
            .cloned()
            .ok_or_else(|| DittoError::not_found("scan result", scan_id))
    }
}

pub const SAMPLE_SCAN_JSON: &str = r#"{
  "systemInfo": {"osVersion": "Windows 11", "cpuModel": "x", "memory": 8192, "diskSpace": 256000},
  "networkInfo": {"interfaces": [{"name": "Ethernet", "ipAddress": "10.0.0.5", "macAddress": "00:11:22:33:44:55"}], "openPorts": [135, 445]},
  "securityInfo": {"firewall": {"enabled": true, "rules": 12}, "uac": {"enabled": true}}
}"#;

pub fn sample_scan_result() -> ScanResult {
    ScanResult::from_slice(SAMPLE_SCAN_JSON.as_bytes()).unwrap()
}

// ============================================================================
// Configs and fake tools
// ============================================================================

/// Write an executable-by-`sh` script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// Scan settings running `collector_body` with `sh` and short timings
pub fn scan_config(root: &Path, collector_body: &str) -> ScanConfig {
    let script = write_script(root, "collector.sh", collector_body);
    ScanConfig {
        program: "sh".to_string(),
        args: vec!["{script}".to_string()],
        script,
        output_dir: root.join("output"),
        timeout: Duration::from_secs(10),
        monitor_interval: Duration::from_millis(20),
        ..ScanConfig::default()
    }
}

/// A collector that writes `json` as its artifact
pub fn collector_writing(json: &str) -> String {
    format!("cat > security_posture.json <<'EOF'\n{}\nEOF\n", json)
}

pub fn vm_config(root: &Path) -> VmConfig {
    VmConfig {
        base_dir: root.join("vagrant"),
        poll_interval: Duration::from_millis(10),
        poll_retries: 5,
        ..VmConfig::default()
    }
}

/// Emulation settings running `runner_body` with `sh`
pub fn emulation_config(root: &Path, runner_body: &str) -> EmulationConfig {
    let script = write_script(root, "atomic_runner.sh", runner_body);
    EmulationConfig {
        program: "sh".to_string(),
        args: vec!["{script}".to_string()],
        script,
        results_dir: root.join("emulation_results"),
        timeout: Duration::from_secs(10),
        ..EmulationConfig::default()
    }
}

pub const RESULTS_HEADER: &str =
    "Timestamp,Status,Tactic,Technique,Technique Name,Test Number,Test Name,Test GUID,Executor Name,Error Message";

/// Result table with `passed` passing rows out of `total`
pub fn results_csv(total: usize, passed: usize) -> String {
    let mut csv = String::from(RESULTS_HEADER);
    csv.push('\n');
    for i in 0..total {
        let status = if i < passed { "Pass" } else { "Fail" };
        let error = if i < passed { "" } else { "exit code 1" };
        csv.push_str(&format!(
            "2024-06-10 12:00:{:02},{},discovery,T1082,System Information Discovery,{},Test {},guid-{},powershell,{}\n",
            i, status, i + 1, i + 1, i, error
        ));
    }
    csv
}

/// A test runner that records its arguments and writes `csv` as its artifact
pub fn runner_writing(csv: &str) -> String {
    format!(
        "echo \"$@\" > args.txt\ncat > atomic_results.csv <<'EOF'\n{}EOF\n",
        csv
    )
}

// ============================================================================
// Polling
// ============================================================================

/// Poll `check` every 10ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

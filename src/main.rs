use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cyberditto::config::DittoConfig;
use cyberditto::deploy::{DeployPhase, DeploymentService, DeploymentStatus};
use cyberditto::emulation::{
    DirectVmResolver, EmulationMode, EmulationRequest, EmulationResult, EmulationService,
    EmulationStatus, PatternTechniqueValidator,
};
use cyberditto::jobs::{JobPhase, JobStatus};
use cyberditto::process::{CommandRunner, SystemCommandRunner};
use cyberditto::scan::{CommandPrivilegeProbe, ScanPhase, ScanResult, ScanService};
use cyberditto::shutdown::install_shutdown_handler;
use cyberditto::vm::{VmController, VmLifecycle};

/// How often the CLI polls a job it is waiting on
const WAIT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "cyberditto")]
#[command(version)]
#[command(about = "Host security scans, VM digital twins and adversary emulation")]
#[command(propagate_version = true)]
struct Args {
    /// Directory holding scripts/, output/, vagrant/ and emulation_results/
    #[arg(long, global = true, default_value = ".")]
    project_root: PathBuf,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a host security scan and print its result
    Scan,

    /// Deploy a VM seeded from a scan artifact and wait until it is up
    Deploy {
        /// Scan artifact (security_posture.json) to seed the VM with
        #[arg(long)]
        scan_result: PathBuf,
    },

    /// Run an adversary-emulation suite against a VM
    Emulate {
        /// VM handle (vm_<id>) to run the tests in
        #[arg(long)]
        vm: String,

        /// tactic, technique or custom
        #[arg(long)]
        mode: EmulationMode,

        /// Tactic name, technique id, or comma-separated technique ids
        #[arg(long)]
        target: String,

        /// Comma-separated test numbers
        #[arg(long)]
        test_numbers: Option<String>,
    },

    /// VM management commands
    Vm {
        #[command(subcommand)]
        command: VmCommands,
    },
}

#[derive(clap::Subcommand, Debug)]
enum VmCommands {
    /// List known VMs with their live state
    List,
    /// Show the live state of one VM
    Status { handle: String },
    /// Power on a VM
    Start { handle: String },
    /// Power off a VM
    Stop { handle: String },
    /// Destroy a VM and remove its directory
    Destroy { handle: String },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ScanOutput {
    scan_id: String,
    status: JobStatus<ScanPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<ScanResult>,
}

#[derive(Serialize)]
struct DeployOutput {
    deployment_id: String,
    scan_id: String,
    status: DeploymentStatus,
}

#[derive(Serialize)]
struct EmulationOutput {
    emulation_id: String,
    status: EmulationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<EmulationResult>,
}

#[derive(Serialize)]
struct VmStateOutput {
    handle: String,
    status: String,
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_scan(
    config: &DittoConfig,
    runner: Arc<dyn CommandRunner>,
    output: &OutputFormat,
    shutdown: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let probe = Arc::new(CommandPrivilegeProbe::new(runner, &config.scan));
    let scans = ScanService::new(config.scan.clone(), probe);

    let scan_id = scans.start().await?;
    eprintln!("Scan {} started", scan_id);

    let status = loop {
        let status = scans.status(&scan_id).await?;
        if status.phase.is_terminal() {
            break status;
        }
        tracing::debug!(scan_id = %scan_id, phase = %status.phase, progress = status.progress, "Waiting for scan");
        tokio::select! {
            _ = shutdown.cancelled() => {
                scans.cancel(&scan_id).await?;
                break scans.status(&scan_id).await?;
            }
            _ = tokio::time::sleep(WAIT_INTERVAL) => {}
        }
    };
    let result = scans.result(&scan_id).await.ok();
    let phase = status.phase;

    match output {
        OutputFormat::Json => {
            let out = ScanOutput {
                scan_id,
                status,
                result,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Scan ID:     {}", scan_id);
            print_job_status(&status);
            if let Some(result) = result {
                let info = &result.system_info;
                println!("OS Version:  {}", info.os_version);
                println!("CPU Model:   {}", info.cpu_model);
                println!("Memory:      {} MB", info.memory);
                println!("Disk Space:  {} MB", info.disk_space);
                println!("Open Ports:  {}", result.network_info.open_ports.len());
                println!(
                    "Firewall:    {}",
                    if result.security_info.firewall.enabled {
                        "enabled"
                    } else {
                        "disabled"
                    }
                );
            }
        }
    }

    if phase != ScanPhase::Completed {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_deploy(
    config: &DittoConfig,
    runner: Arc<dyn CommandRunner>,
    scan_result: PathBuf,
    output: &OutputFormat,
    shutdown: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = ScanResult::from_file(&scan_result).await?;

    let probe = Arc::new(CommandPrivilegeProbe::new(runner.clone(), &config.scan));
    let scans = Arc::new(ScanService::new(config.scan.clone(), probe));
    let scan_id = scans.import_result(result).await?;

    let vms = Arc::new(VmController::new(config.vm.clone(), runner).await?);
    let deployments = DeploymentService::new(&config.vm, vms, scans);

    let deployment_id = deployments.start(&scan_id).await?;
    eprintln!("Deployment {} started", deployment_id);

    let status = loop {
        let status = deployments.status(&deployment_id).await?;
        let phase = status.status.phase;
        if phase.is_terminal() || phase.is_steady() {
            break status;
        }
        tracing::debug!(deployment_id = %deployment_id, phase = %phase, "Waiting for deployment");
        tokio::select! {
            _ = shutdown.cancelled() => {
                deployments.cancel(&deployment_id).await?;
                break deployments.status(&deployment_id).await?;
            }
            _ = tokio::time::sleep(WAIT_INTERVAL) => {}
        }
    };

    let phase = status.status.phase;
    match output {
        OutputFormat::Json => {
            let out = DeployOutput {
                deployment_id,
                scan_id,
                status,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Deployment ID: {}", deployment_id);
            println!("Scan ID:       {}", scan_id);
            if let Some(handle) = &status.vm_handle {
                println!("VM Handle:     {}", handle);
            }
            print_job_status(&status.status);
        }
    }

    if phase != DeployPhase::Running {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_emulate(
    config: &DittoConfig,
    runner: Arc<dyn CommandRunner>,
    request: EmulationRequest,
    output: &OutputFormat,
    shutdown: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let vms: Arc<dyn VmLifecycle> = Arc::new(VmController::new(config.vm.clone(), runner).await?);
    let emulations = EmulationService::new(
        config.emulation.clone(),
        vms.clone(),
        Arc::new(DirectVmResolver::new(vms)),
        Arc::new(PatternTechniqueValidator::default()),
    );

    let emulation_id = emulations.start(request).await?;
    eprintln!("Emulation {} started", emulation_id);

    let status = loop {
        let status = emulations.status(&emulation_id).await?;
        if status.phase.is_terminal() {
            break status;
        }
        tokio::select! {
            _ = shutdown.cancelled() => {
                emulations.cancel(&emulation_id).await?;
                break emulations.status(&emulation_id).await?;
            }
            _ = tokio::time::sleep(WAIT_INTERVAL) => {}
        }
    };
    let result = emulations.result(&emulation_id).await.ok();
    let completed = result.is_some();

    match output {
        OutputFormat::Json => {
            let out = EmulationOutput {
                emulation_id,
                status,
                result,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Emulation ID: {}", emulation_id);
            println!("Phase:        {}", status.phase);
            if !status.message.is_empty() {
                println!("Message:      {}", status.message);
            }
            if !status.error.is_empty() {
                println!("Error:        {}", status.error);
            }
            if let Some(result) = result {
                let s = result.summary;
                println!(
                    "Tests:        {} total, {} passed, {} failed ({:.1}%)",
                    s.total_tests, s.passed_tests, s.failed_tests, s.success_rate
                );
                if !result.results.is_empty() {
                    println!();
                    println!(
                        "{:<8} {:<10} {:<24} {:<6} TEST",
                        "STATUS", "TECHNIQUE", "TACTIC", "NUM"
                    );
                    println!("{}", "-".repeat(78));
                    for test in &result.results {
                        println!(
                            "{:<8} {:<10} {:<24} {:<6} {}",
                            test.status,
                            test.technique,
                            test.tactic,
                            test.test_number,
                            test.test_name
                        );
                    }
                }
            }
        }
    }

    if !completed {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_vm(
    config: &DittoConfig,
    runner: Arc<dyn CommandRunner>,
    command: VmCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let vms = VmController::new(config.vm.clone(), runner).await?;

    let (handle, action) = match command {
        VmCommands::List => {
            let list = vms.list().await;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&list)?),
                OutputFormat::Table => {
                    if list.is_empty() {
                        println!("No VMs found.");
                    } else {
                        println!(
                            "{:<24} {:<12} {:<26} CREATED",
                            "ID", "STATUS", "SCAN ID"
                        );
                        println!("{}", "-".repeat(86));
                        for vm in &list {
                            let created = vm
                                .created_at
                                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                                .unwrap_or_else(|| "-".to_string());
                            println!(
                                "{:<24} {:<12} {:<26} {}",
                                vm.id, vm.status, vm.scan_id, created
                            );
                        }
                    }
                }
            }
            return Ok(());
        }
        VmCommands::Status { handle } => {
            let state = vms.status(&handle).await?;
            match output {
                OutputFormat::Json => {
                    let out = VmStateOutput {
                        handle,
                        status: state.to_string(),
                    };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                OutputFormat::Table => println!("{}: {}", handle, state),
            }
            return Ok(());
        }
        VmCommands::Start { handle } => {
            vms.start(&handle).await?;
            (handle, "started")
        }
        VmCommands::Stop { handle } => {
            vms.stop(&handle).await?;
            (handle, "stopped")
        }
        VmCommands::Destroy { handle } => {
            vms.destroy(&handle).await?;
            (handle, "destroyed")
        }
    };

    match output {
        OutputFormat::Json => {
            let out = VmStateOutput {
                handle,
                status: action.to_string(),
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => println!("VM {} {}", handle, action),
    }
    Ok(())
}

fn print_job_status<P: JobPhase>(status: &JobStatus<P>) {
    println!("Phase:       {}", status.phase);
    println!("Progress:    {:.0}%", status.progress);
    if !status.message.is_empty() && status.message != status.error {
        println!("Message:     {}", status.message);
    }
    if !status.error.is_empty() {
        println!("Error:       {}", status.error);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = DittoConfig::new(&args.project_root);
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
    let shutdown = install_shutdown_handler();

    let result = match args.command {
        Commands::Scan => handle_scan(&config, runner, &args.output, &shutdown).await,
        Commands::Deploy { scan_result } => {
            handle_deploy(&config, runner, scan_result, &args.output, &shutdown).await
        }
        Commands::Emulate {
            vm,
            mode,
            target,
            test_numbers,
        } => {
            let request = EmulationRequest {
                deployment_id: vm,
                mode,
                target,
                test_numbers,
            };
            handle_emulate(&config, runner, request, &args.output, &shutdown).await
        }
        Commands::Vm { command } => handle_vm(&config, runner, command, &args.output).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

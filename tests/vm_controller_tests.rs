mod test_harness;

use std::sync::Arc;

use cyberditto::error::DittoError;
use cyberditto::vm::descriptor::{DESCRIPTOR_FILE, METADATA_FILE, SEED_FILE};
use cyberditto::vm::{CanonicalState, VmController, VmLifecycle, VmSeed};
use test_harness::{failed, ok, vm_config, FakeCommandRunner};

fn seed() -> VmSeed {
    VmSeed {
        scan_id: "scan_1".to_string(),
        deployment_id: "deploy_1".to_string(),
        data: serde_json::json!({"systemInfo": {"osVersion": "Windows 11"}}),
    }
}

const VAGRANT_POWEROFF: &str =
    "Current machine states:\n\ndefault                   poweroff (virtualbox)\n";

fn first(args: &[String]) -> Option<&str> {
    args.first().map(String::as_str)
}

/// Hypervisor reports `state`; every other command succeeds.
fn hypervisor_reporting(state: &'static str) -> Arc<FakeCommandRunner> {
    FakeCommandRunner::new(move |program, args| {
        if program == "VBoxManage" && first(args) == Some("showvminfo") {
            ok(&format!(
                "name=\"x\"\nVMState=\"{}\"\nVMStateChangeTime=\"2024-06-10\"\n",
                state
            ))
        } else {
            ok("")
        }
    })
}

#[tokio::test]
async fn test_create_writes_instance_files_and_provisions() {
    let root = tempfile::tempdir().unwrap();
    let config = vm_config(root.path());
    let runner = hypervisor_reporting("running");
    let controller = VmController::new(config.clone(), runner.clone()).await.unwrap();

    let handle = controller.create(&seed()).await.unwrap();
    assert!(handle.starts_with("vm_"));
    assert!(controller.contains(&handle).await);

    let dir = config.base_dir.join(&handle);
    assert!(dir.join(DESCRIPTOR_FILE).exists());
    assert!(dir.join(METADATA_FILE).exists());
    let seeded: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.join(SEED_FILE)).unwrap()).unwrap();
    assert_eq!(seeded["systemInfo"]["osVersion"], "Windows 11");

    let up = runner
        .calls_to("vagrant")
        .into_iter()
        .find(|c| c.args == vec!["up"])
        .expect("vagrant up was not run");
    assert_eq!(up.cwd.as_deref(), Some(dir.as_path()));

    assert_eq!(controller.status(&handle).await.unwrap(), CanonicalState::Running);
}

#[tokio::test]
async fn test_failed_provisioning_forgets_instance() {
    let root = tempfile::tempdir().unwrap();
    let config = vm_config(root.path());
    let runner = FakeCommandRunner::new(|program, args| {
        if program == "vagrant" && first(args) == Some("up") {
            failed("box not found")
        } else {
            ok("")
        }
    });
    let controller = VmController::new(config.clone(), runner).await.unwrap();

    let err = controller.create(&seed()).await.unwrap_err();
    assert!(err.to_string().contains("box not found"), "{}", err);
    assert!(controller.handles().await.is_empty());
    assert_eq!(std::fs::read_dir(&config.base_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn test_status_maps_hypervisor_vocabulary() {
    let root = tempfile::tempdir().unwrap();
    for (raw, expected) in [
        ("running", CanonicalState::Running),
        ("poweroff", CanonicalState::Stopped),
        ("aborted", CanonicalState::Stopped),
        ("saved", CanonicalState::Saved),
    ] {
        let config = vm_config(&root.path().join(raw));
        let controller = VmController::new(config, hypervisor_reporting(raw)).await.unwrap();
        let handle = controller.create(&seed()).await.unwrap();
        assert_eq!(controller.status(&handle).await.unwrap(), expected, "{}", raw);
    }
}

#[tokio::test]
async fn test_status_falls_back_to_provisioner() {
    let root = tempfile::tempdir().unwrap();
    let runner = FakeCommandRunner::new(|program, args| match (program, first(args)) {
        ("VBoxManage", _) => failed("VBoxManage: command not found"),
        ("vagrant", Some("status")) => ok(VAGRANT_POWEROFF),
        _ => ok(""),
    });
    let controller = VmController::new(vm_config(root.path()), runner.clone())
        .await
        .unwrap();

    let handle = controller.create(&seed()).await.unwrap();
    assert_eq!(controller.status(&handle).await.unwrap(), CanonicalState::Stopped);
    assert!(runner.saw("vagrant status"));
}

#[tokio::test]
async fn test_unrecognised_answers_resolve_to_unknown() {
    let root = tempfile::tempdir().unwrap();
    let runner = FakeCommandRunner::new(|program, args| match (program, first(args)) {
        ("VBoxManage", Some("showvminfo")) => ok("VMState=\"teleporting\"\n"),
        ("vagrant", Some("status")) => ok("nothing useful here\n"),
        _ => ok(""),
    });
    let controller = VmController::new(vm_config(root.path()), runner).await.unwrap();

    let handle = controller.create(&seed()).await.unwrap();
    assert_eq!(controller.status(&handle).await.unwrap(), CanonicalState::Unknown);
}

#[tokio::test]
async fn test_start_and_stop_fall_back_to_provisioner() {
    let root = tempfile::tempdir().unwrap();
    let runner = FakeCommandRunner::new(|program, args| match (program, first(args)) {
        ("VBoxManage", Some("startvm")) | ("VBoxManage", Some("controlvm")) => failed("locked"),
        _ => ok(""),
    });
    let controller = VmController::new(vm_config(root.path()), runner.clone())
        .await
        .unwrap();
    let handle = controller.create(&seed()).await.unwrap();

    controller.start(&handle).await.unwrap();
    controller.stop(&handle).await.unwrap();

    assert!(runner.saw(&format!("VBoxManage startvm CyberDitto_{} --type headless", handle)));
    assert!(runner.saw(&format!("VBoxManage controlvm CyberDitto_{} poweroff", handle)));
    assert!(runner.saw("vagrant halt -f"));
    // One `up` for create, one for the start fallback
    let ups = runner
        .calls_to("vagrant")
        .iter()
        .filter(|c| c.args == vec!["up"])
        .count();
    assert_eq!(ups, 2);
}

#[tokio::test]
async fn test_destroy_removes_instance() {
    let root = tempfile::tempdir().unwrap();
    let config = vm_config(root.path());
    let runner = FakeCommandRunner::always_ok();
    let controller = VmController::new(config.clone(), runner.clone()).await.unwrap();
    let handle = controller.create(&seed()).await.unwrap();

    controller.destroy(&handle).await.unwrap();

    assert!(runner.saw(&format!("VBoxManage unregistervm CyberDitto_{} --delete", handle)));
    assert!(!controller.contains(&handle).await);
    assert!(!config.base_dir.join(&handle).exists());

    let err = controller.status(&handle).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_destroy_failure_keeps_instance() {
    let root = tempfile::tempdir().unwrap();
    let runner = FakeCommandRunner::new(|program, args| match (program, first(args)) {
        ("VBoxManage", Some("unregistervm")) => failed("VM is locked"),
        ("vagrant", Some("destroy")) => failed("machine is busy"),
        _ => ok(""),
    });
    let controller = VmController::new(vm_config(root.path()), runner.clone())
        .await
        .unwrap();
    let handle = controller.create(&seed()).await.unwrap();

    let err = controller.destroy(&handle).await.unwrap_err();
    assert!(matches!(err, DittoError::ExternalTool(_)));
    assert!(controller.contains(&handle).await);
    assert!(runner.saw("vagrant destroy -f"));
}

#[tokio::test]
async fn test_instances_are_rediscovered_on_startup() {
    let root = tempfile::tempdir().unwrap();
    let config = vm_config(root.path());
    let handle = {
        let controller = VmController::new(config.clone(), FakeCommandRunner::always_ok())
            .await
            .unwrap();
        controller.create(&seed()).await.unwrap()
    };
    // A directory without a descriptor is not an instance
    std::fs::create_dir_all(config.base_dir.join("scratch")).unwrap();

    let controller = VmController::new(config, hypervisor_reporting("saved"))
        .await
        .unwrap();
    assert_eq!(controller.handles().await, vec![handle.clone()]);

    let listed = controller.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, handle);
    assert_eq!(listed[0].name, format!("CyberDitto_{}", handle));
    assert_eq!(listed[0].status, CanonicalState::Saved);
    assert_eq!(listed[0].scan_id, "scan_1");
    assert!(listed[0].created_at.is_some());
}

#[tokio::test]
async fn test_unknown_handle_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let controller = VmController::new(vm_config(root.path()), FakeCommandRunner::always_ok())
        .await
        .unwrap();

    for err in [
        controller.start("vm_missing").await.unwrap_err(),
        controller.stop("vm_missing").await.unwrap_err(),
        controller.destroy("vm_missing").await.unwrap_err(),
        controller.status("vm_missing").await.unwrap_err(),
        controller.exec_guest("vm_missing", "Get-Date").await.unwrap_err(),
    ] {
        assert!(err.is_not_found(), "{}", err);
    }
}

#[tokio::test]
async fn test_exec_guest_runs_powershell_through_provisioner() {
    let root = tempfile::tempdir().unwrap();
    let runner = FakeCommandRunner::always_ok();
    let controller = VmController::new(vm_config(root.path()), runner.clone())
        .await
        .unwrap();
    let handle = controller.create(&seed()).await.unwrap();

    controller.exec_guest(&handle, "Stop-Process -Name atomic").await.unwrap();

    let call = runner
        .calls_to("vagrant")
        .into_iter()
        .find(|c| c.args.first().map(String::as_str) == Some("powershell"))
        .unwrap();
    assert_eq!(call.args, vec!["powershell", "-c", "Stop-Process -Name atomic"]);
}

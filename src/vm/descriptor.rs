use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::VmConfig;

pub const DESCRIPTOR_FILE: &str = "Vagrantfile";
pub const SEED_FILE: &str = "security_posture.json";
pub const METADATA_FILE: &str = "vm_metadata.json";

/// Bookkeeping written beside each instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmMetadata {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scan_id: String,
    #[serde(default)]
    pub deployment_id: String,
}

/// Render the provisioning descriptor for one instance. The handle is both
/// the machine key and part of the hypervisor display name.
pub fn render_descriptor(config: &VmConfig, handle: &str) -> String {
    format!(
        r#"Vagrant.configure("2") do |config|
  config.vm.box = "{box_name}"
  config.vm.box_version = "{box_version}"
  config.vm.define "{handle}" do |vm|
    vm.vm.provider "virtualbox" do |vb|
      vb.memory = "{memory}"
      vb.cpus = {cpus}
      vb.gui = {gui}
      vb.name = "{name}"
      vb.customize ["modifyvm", :id, "--vram", "128"]
      vb.customize ["modifyvm", :id, "--accelerate3d", "on"]
    end
  end

  config.vm.provision "file", source: "{seed}", destination: "C:/{seed}"

  config.vm.provision "shell", inline: <<-SHELL
    Write-Host "Setting up Windows 11 environment..."
  SHELL
end
"#,
        box_name = config.box_name,
        box_version = config.box_version,
        handle = handle,
        memory = config.memory_mb,
        cpus = config.cpus,
        gui = config.gui,
        name = config.instance_name(handle),
        seed = SEED_FILE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_embeds_handle_and_display_name() {
        let text = render_descriptor(&VmConfig::default(), "vm_123");
        assert!(text.contains(r#"config.vm.define "vm_123""#));
        assert!(text.contains(r#"vb.name = "CyberDitto_vm_123""#));
        assert!(text.contains(r#"source: "security_posture.json""#));
        assert!(text.contains(r#"vb.memory = "4096""#));
    }

    #[test]
    fn metadata_uses_camel_case() {
        let meta = VmMetadata {
            created_at: Utc::now(),
            scan_id: "scan_1".to_string(),
            deployment_id: "deploy_1".to_string(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["scanId"], "scan_1");
        assert_eq!(json["deploymentId"], "deploy_1");
        assert!(json.get("createdAt").is_some());
    }
}

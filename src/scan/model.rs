use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DittoError, Result};
use crate::process::strip_bom;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SystemInfo {
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub cpu_model: String,
    /// MiB
    #[serde(default)]
    pub memory: i64,
    /// MiB
    #[serde(default)]
    pub disk_space: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkInterface {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub mac_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkInfo {
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub open_ports: Vec<u16>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FirewallInfo {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UacInfo {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SecurityInfo {
    #[serde(default)]
    pub firewall: FirewallInfo,
    #[serde(default)]
    pub antivirus: Vec<String>,
    #[serde(default)]
    pub updates: Vec<String>,
    #[serde(default)]
    pub uac: UacInfo,
}

/// Security posture of the scanned host.
///
/// `id` and `created_at` are stamped when the result is attached to its job;
/// the collector does not have to provide them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScanResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub system_info: SystemInfo,
    #[serde(default)]
    pub network_info: NetworkInfo,
    #[serde(default)]
    pub security_info: SecurityInfo,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ScanResult {
    /// Parse a collector artifact. A leading byte-order mark is ignored and
    /// unknown fields are rejected.
    pub fn from_slice(content: &[u8]) -> Result<Self> {
        let result: ScanResult = serde_json::from_slice(strip_bom(content))
            .map_err(|e| DittoError::ExternalTool(format!("failed to parse scan results: {}", e)))?;
        result.validate()?;
        Ok(result)
    }

    pub async fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = tokio::fs::read(path).await.map_err(|e| {
            DittoError::ExternalTool(format!("failed to read scan results: {}", e))
        })?;
        Self::from_slice(&content)
    }

    /// Required fields: OS version, CPU model, memory and disk space.
    pub fn validate(&self) -> Result<()> {
        let info = &self.system_info;
        if info.os_version.trim().is_empty() {
            return Err(DittoError::Validation("missing OS version".to_string()));
        }
        if info.cpu_model.trim().is_empty() {
            return Err(DittoError::Validation("missing CPU model".to_string()));
        }
        if info.memory <= 0 {
            return Err(DittoError::Validation("invalid memory value".to_string()));
        }
        if info.disk_space <= 0 {
            return Err(DittoError::Validation("invalid disk space value".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTIFACT: &str = r#"{
        "systemInfo": {"osVersion": "Win11", "cpuModel": "x", "memory": 8192, "diskSpace": 256000},
        "networkInfo": {
            "interfaces": [{"name": "eth0", "ipAddress": "10.0.0.2", "macAddress": "00:11:22:33:44:55"}],
            "openPorts": [135, 445],
            "dnsServers": ["10.0.0.1"],
            "services": ["WinDefend"]
        },
        "securityInfo": {
            "firewall": {"enabled": true, "rules": 12},
            "antivirus": ["Windows Defender"],
            "updates": ["KB5030219"],
            "uac": {"enabled": true}
        }
    }"#;

    #[test]
    fn parses_full_artifact() {
        let result = ScanResult::from_slice(ARTIFACT.as_bytes()).unwrap();
        assert_eq!(result.system_info.os_version, "Win11");
        assert_eq!(result.system_info.memory, 8192);
        assert_eq!(result.network_info.open_ports, vec![135, 445]);
        assert!(result.security_info.firewall.enabled);
        assert!(result.security_info.uac.enabled);
    }

    #[test]
    fn byte_order_mark_is_ignored() {
        let mut content = b"\xef\xbb\xbf".to_vec();
        content.extend_from_slice(ARTIFACT.as_bytes());
        assert!(ScanResult::from_slice(&content).is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let content = r#"{"systemInfo": {"osVersion": "Win11", "cpuModel": "x", "memory": 1, "diskSpace": 1, "gpu": "y"}}"#;
        let err = ScanResult::from_slice(content.as_bytes()).unwrap_err();
        assert!(matches!(err, DittoError::ExternalTool(_)));
    }

    #[test]
    fn missing_cpu_model_fails_validation() {
        let content = r#"{"systemInfo": {"osVersion": "Win11", "memory": 8192, "diskSpace": 256000}}"#;
        let err = ScanResult::from_slice(content.as_bytes()).unwrap_err();
        assert!(matches!(err, DittoError::Validation(_)));
        assert!(err.to_string().contains("missing CPU model"));
    }

    #[test]
    fn each_required_field_is_checked() {
        let mut result = ScanResult::from_slice(ARTIFACT.as_bytes()).unwrap();
        result.system_info.disk_space = 0;
        assert!(result.validate().unwrap_err().to_string().contains("invalid disk space value"));
        result.system_info.memory = -1;
        assert!(result.validate().unwrap_err().to_string().contains("invalid memory value"));
        result.system_info.os_version.clear();
        assert!(result.validate().unwrap_err().to_string().contains("missing OS version"));
    }
}

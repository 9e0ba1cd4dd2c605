use serde::{Deserialize, Serialize};

/// VM state after normalising the hypervisor and provisioning-tool vocabularies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalState {
    Running,
    Stopped,
    Saved,
    NotCreated,
    Unknown,
}

impl CanonicalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalState::Running => "running",
            CanonicalState::Stopped => "stopped",
            CanonicalState::Saved => "saved",
            CanonicalState::NotCreated => "not_created",
            CanonicalState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CanonicalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Parse `VBoxManage showvminfo --machinereadable` output.
pub fn parse_hypervisor_state(output: &str) -> CanonicalState {
    for line in output.lines() {
        let Some(value) = line.trim().strip_prefix("VMState=") else {
            continue;
        };
        return match value.trim().trim_matches('"').to_lowercase().as_str() {
            "running" => CanonicalState::Running,
            "poweroff" | "aborted" => CanonicalState::Stopped,
            "saved" => CanonicalState::Saved,
            "notcreated" => CanonicalState::NotCreated,
            _ => CanonicalState::Unknown,
        };
    }
    CanonicalState::Unknown
}

/// Extracts a VM state from human-readable, line-oriented CLI output.
///
/// Kept behind a trait so the text scraping can be swapped for a structured
/// query without touching callers.
pub trait StatusLineParser: Send + Sync {
    fn parse(&self, output: &str, handle: &str) -> CanonicalState;
}

/// Finds the first line mentioning the handle (or the provisioning tool's
/// default machine name) and matches state tokens case-insensitively.
#[derive(Debug, Clone)]
pub struct SubstringStatusParser {
    default_name: String,
}

impl Default for SubstringStatusParser {
    fn default() -> Self {
        Self {
            default_name: "default".to_string(),
        }
    }
}

impl SubstringStatusParser {
    pub fn new(default_name: impl Into<String>) -> Self {
        Self {
            default_name: default_name.into(),
        }
    }
}

impl StatusLineParser for SubstringStatusParser {
    fn parse(&self, output: &str, handle: &str) -> CanonicalState {
        for line in output.lines() {
            if !line.contains(handle) && !line.contains(self.default_name.as_str()) {
                continue;
            }
            let line = line.to_lowercase();
            if line.contains("running") {
                return CanonicalState::Running;
            } else if line.contains("poweroff")
                || line.contains("aborted")
                || line.contains("stopped")
            {
                return CanonicalState::Stopped;
            } else if line.contains("saved") {
                return CanonicalState::Saved;
            } else if line.contains("not created") {
                return CanonicalState::NotCreated;
            }
        }
        CanonicalState::Unknown
    }
}

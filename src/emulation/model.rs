use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DittoError;
use crate::jobs::{JobPhase, JobRecord};

/// How `target` is interpreted by the test runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmulationMode {
    /// A tactic name, e.g. `discovery`
    Tactic,
    /// One technique id, e.g. `T1082`
    Technique,
    /// Comma-separated chain of technique ids
    Custom,
}

impl EmulationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmulationMode::Tactic => "tactic",
            EmulationMode::Technique => "technique",
            EmulationMode::Custom => "custom",
        }
    }
}

impl fmt::Display for EmulationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EmulationMode {
    type Err = DittoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tactic" => Ok(EmulationMode::Tactic),
            "technique" => Ok(EmulationMode::Technique),
            "custom" => Ok(EmulationMode::Custom),
            other => Err(DittoError::Validation(format!("invalid mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulationRequest {
    pub deployment_id: String,
    pub mode: EmulationMode,
    pub target: String,
    /// Comma-separated test numbers to restrict the run to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_numbers: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmulationPhase {
    Preparing,
    Running,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl fmt::Display for EmulationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EmulationPhase::Preparing => "preparing",
            EmulationPhase::Running => "running",
            EmulationPhase::Processing => "processing",
            EmulationPhase::Completed => "completed",
            EmulationPhase::Error => "error",
            EmulationPhase::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl JobPhase for EmulationPhase {
    fn rank(&self) -> u8 {
        match self {
            EmulationPhase::Preparing => 0,
            EmulationPhase::Running => 1,
            EmulationPhase::Processing => 2,
            EmulationPhase::Completed => 3,
            EmulationPhase::Error | EmulationPhase::Cancelled => u8::MAX,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            EmulationPhase::Completed | EmulationPhase::Error | EmulationPhase::Cancelled
        )
    }

    fn error() -> Self {
        EmulationPhase::Error
    }

    fn cancelled() -> Self {
        EmulationPhase::Cancelled
    }
}

/// One row of the runner's result table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRecord {
    pub timestamp: String,
    pub status: String,
    pub tactic: String,
    pub technique: String,
    pub technique_name: String,
    pub test_number: String,
    pub test_name: String,
    pub test_guid: String,
    pub executor_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

impl TestRecord {
    pub fn passed(&self) -> bool {
        self.status == "Pass"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TestSummary {
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub success_rate: f64,
}

impl TestSummary {
    pub fn from_records(records: &[TestRecord]) -> Self {
        let total = records.len();
        let passed = records.iter().filter(|r| r.passed()).count();
        let success_rate = if total == 0 {
            0.0
        } else {
            passed as f64 / total as f64 * 100.0
        };
        Self {
            total_tests: total,
            passed_tests: passed,
            failed_tests: total - passed,
            success_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmulationResult {
    pub id: String,
    pub deploy_id: String,
    pub status: String,
    pub summary: TestSummary,
    pub results: Vec<TestRecord>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmulationDetail {
    pub deployment_id: String,
    pub mode: EmulationMode,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_numbers: Option<String>,
    pub vm_handle: String,
    pub exec_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EmulationResult>,
}

pub type EmulationJob = JobRecord<EmulationPhase, EmulationDetail>;

/// What a poller sees for one execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmulationStatus {
    pub phase: EmulationPhase,
    pub progress: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&EmulationJob> for EmulationStatus {
    fn from(job: &EmulationJob) -> Self {
        Self {
            phase: job.status.phase,
            progress: job.status.progress,
            message: job.status.message.clone(),
            error: job.status.error.clone(),
            start_time: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: &str) -> TestRecord {
        TestRecord {
            timestamp: "2024-01-01 00:00:00".to_string(),
            status: status.to_string(),
            tactic: "discovery".to_string(),
            technique: "T1082".to_string(),
            technique_name: "System Information Discovery".to_string(),
            test_number: "1".to_string(),
            test_name: "systeminfo".to_string(),
            test_guid: "guid".to_string(),
            executor_name: "command_prompt".to_string(),
            error_message: String::new(),
        }
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Technique".parse::<EmulationMode>().unwrap(), EmulationMode::Technique);
        assert_eq!("custom".parse::<EmulationMode>().unwrap(), EmulationMode::Custom);
        assert!("everything".parse::<EmulationMode>().is_err());
    }

    #[test]
    fn summary_counts_only_literal_pass() {
        let records = vec![record("Pass"), record("pass"), record("Fail"), record("Pass")];
        let summary = TestSummary::from_records(&records);
        assert_eq!(summary.total_tests, 4);
        assert_eq!(summary.passed_tests, 2);
        assert_eq!(summary.failed_tests, 2);
        assert_eq!(summary.success_rate, 50.0);
    }

    #[test]
    fn empty_summary_has_zero_rate() {
        let summary = TestSummary::from_records(&[]);
        assert_eq!(summary.total_tests, 0);
        assert_eq!(summary.success_rate, 0.0);
    }

    #[test]
    fn summary_uses_snake_case() {
        let json = serde_json::to_value(TestSummary::from_records(&[record("Pass")])).unwrap();
        assert_eq!(json["total_tests"], 1);
        assert_eq!(json["success_rate"], 100.0);
    }
}

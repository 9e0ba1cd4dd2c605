//! Adversary-emulation jobs.
//!
//! Phases: `preparing → running → processing → completed`, with `error` and
//! `cancelled` from any non-terminal phase. The test runner is driven through
//! the process adapter and must leave a CSV table with the fixed columns
//! `timestamp, status, tactic, technique, techniqueName, testNumber,
//! testName, testGUID, executorName[, errorMessage]`. A row passes only when
//! its status is exactly `Pass`.

pub mod model;
pub mod results;
pub mod service;
pub mod validator;

pub use model::{
    EmulationDetail, EmulationJob, EmulationMode, EmulationPhase, EmulationRequest,
    EmulationResult, EmulationStatus, TestRecord, TestSummary,
};
pub use results::parse_results;
pub use service::{DirectVmResolver, EmulationService};
pub use validator::{validate_request, PatternTechniqueValidator, TechniqueValidator};

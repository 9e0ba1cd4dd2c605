//! External process adapter.
//!
//! - [`ProcessRunner`]: launches a scan or test-runner executable inside an
//!   isolated run directory, enforces an absolute timeout and validates the
//!   artifact the tool leaves behind
//! - [`progress`]: polls the side files (`progress.json`, `scan.log`) a tool
//!   writes while it runs and forwards changed snapshots only
//! - [`CommandRunner`]: short-lived CLI invocations (hypervisor, provisioning
//!   tool, privilege probe)
//!
//! A zero exit status is not enough for success: the expected artifact must
//! exist and parse in its declared format.

pub mod command;
pub mod progress;
pub mod runner;

pub use command::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use progress::{read_log, read_progress, ProgressEvent, ProgressSnapshot};
pub use runner::{prepare_run_dir, ArtifactFormat, ArtifactSpec, ProcessRunner, ProcessSpec};

const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

/// Drop a leading UTF-8 byte-order mark. PowerShell writes one by default.
pub fn strip_bom(content: &[u8]) -> &[u8] {
    content.strip_prefix(UTF8_BOM).unwrap_or(content)
}

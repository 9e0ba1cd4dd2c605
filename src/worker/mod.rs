//! Background execution for job tasks.
//!
//! - [`spawn_supervised`]: runs one job's unit of work on its own task and
//!   converts errors and panics into the job's error phase
//! - [`RetentionSweeper`]: periodic `cleanup_older_than` over every service
//!
//! Job tasks never return results to callers. They communicate only by
//! mutating their job record; callers poll.

pub mod retention;
pub mod supervisor;

pub use retention::{Retention, RetentionSweeper};
pub use supervisor::spawn_supervised;

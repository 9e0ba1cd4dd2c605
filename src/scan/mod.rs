//! Host security scan jobs.
//!
//! Phases: `starting → scanning → processing → completed`, with `error` and
//! `cancelled` reachable from any non-terminal phase. A scan only starts when
//! the [`PrivilegeProbe`] reports administrative rights.

pub mod model;
pub mod service;

pub use model::{
    FirewallInfo, NetworkInfo, NetworkInterface, ScanResult, SecurityInfo, SystemInfo, UacInfo,
};
pub use service::{
    CommandPrivilegeProbe, PrivilegeProbe, ScanDetail, ScanJob, ScanPhase, ScanResultSource,
    ScanService,
};

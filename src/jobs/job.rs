use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Phase vocabulary of one job kind.
///
/// Phases are ranked along the kind's fixed sequence. A job only moves to a
/// phase of higher rank, stays in its current phase (progress updates), or
/// drops into `error`/`cancelled`. Terminal phases are never left.
pub trait JobPhase: Copy + Eq + fmt::Display + fmt::Debug + Send + Sync + 'static {
    fn rank(&self) -> u8;

    fn is_terminal(&self) -> bool;

    fn error() -> Self;

    fn cancelled() -> Self;

    /// Moves between steady states caused by the outside world, e.g. a VM
    /// that is powered off behind our back. Lateral moves ignore rank.
    fn is_lateral(&self, _next: &Self) -> bool {
        false
    }

    fn can_transition_to(&self, next: &Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *next == Self::error() || *next == Self::cancelled() {
            return true;
        }
        *next == *self || next.rank() > self.rank() || self.is_lateral(next)
    }
}

/// Status snapshot handed to pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus<P> {
    pub phase: P,
    pub progress: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// One job of any kind. `detail` carries the kind-specific attributes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord<P, D> {
    pub id: String,
    pub status: JobStatus<P>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub token: CancellationToken,
    #[serde(flatten)]
    pub detail: D,
}

impl<P: JobPhase, D> JobRecord<P, D> {
    pub fn new(id: String, phase: P, message: impl Into<String>, detail: D) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus {
                phase,
                progress: 0.0,
                message: message.into(),
                error: String::new(),
            },
            created_at: now,
            last_active: now,
            completed_at: None,
            token: CancellationToken::new(),
            detail,
        }
    }

    pub fn phase(&self) -> P {
        self.status.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.status.phase.is_terminal()
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    /// Move to `phase`. Progress never decreases along the forward path;
    /// lateral moves take `progress` as given. Returns false, leaving the
    /// record untouched, when the transition is not allowed.
    pub fn advance(&mut self, phase: P, progress: f64, message: impl Into<String>) -> bool {
        let current = self.status.phase;
        if !current.can_transition_to(&phase) {
            tracing::debug!(
                job_id = %self.id,
                from = %current,
                to = %phase,
                "Rejected phase transition"
            );
            return false;
        }

        let progress = progress.clamp(0.0, 100.0);
        self.status.progress = if current.is_lateral(&phase) {
            progress
        } else {
            progress.max(self.status.progress)
        };
        self.status.phase = phase;
        self.status.message = message.into();
        self.status.error.clear();
        self.touch();
        if phase.is_terminal() {
            self.completed_at = Some(self.last_active);
        }
        true
    }

    /// Enter the error phase. Progress is reset to 0.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let error = error.into();
        self.status.phase = P::error();
        self.status.progress = 0.0;
        self.status.message = error.clone();
        self.status.error = error;
        self.touch();
        self.completed_at = Some(self.last_active);
        self.token.cancel();
        true
    }

    /// Enter the cancelled phase and signal the job task to stop at its next
    /// suspension point.
    pub fn cancel(&mut self, message: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status.phase = P::cancelled();
        self.status.progress = 0.0;
        self.status.message = message.into();
        self.status.error.clear();
        self.touch();
        self.completed_at = Some(self.last_active);
        self.token.cancel();
        true
    }
}

static LAST_ID_NANOS: AtomicI64 = AtomicI64::new(0);

/// Nanosecond timestamp that is strictly greater than every value previously
/// returned in this process.
pub fn unique_nanos() -> i64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut prev = LAST_ID_NANOS.load(Ordering::Relaxed);
    loop {
        let candidate = if now > prev { now } else { prev + 1 };
        match LAST_ID_NANOS.compare_exchange_weak(
            prev,
            candidate,
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(actual) => prev = actual,
        }
    }
}

/// Generate a job identifier such as `scan_1718012345123456789`.
pub fn generate_id(prefix: &str) -> String {
    format!("{}_{}", prefix, unique_nanos())
}

/// Creation time before which a job counts as expired. `None` when `max_age`
/// reaches further back than chrono can represent.
pub fn retention_cutoff(max_age: std::time::Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(max_age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::RetentionConfig;

/// A job service whose old records can be swept.
#[async_trait]
pub trait Retention: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Remove jobs older than `max_age` together with their on-disk
    /// artifacts. Returns how many records were removed.
    async fn cleanup_older_than(&self, max_age: Duration) -> usize;
}

/// Periodically runs `cleanup_older_than` on every registered service
pub struct RetentionSweeper {
    interval: Duration,
    max_age: Duration,
    targets: Vec<Arc<dyn Retention>>,
}

impl RetentionSweeper {
    pub fn new(interval: Duration, max_age: Duration) -> Self {
        Self {
            interval,
            max_age,
            targets: Vec::new(),
        }
    }

    /// Build a sweeper from the retention section, or `None` when sweeping
    /// is disabled.
    pub fn from_config(config: &RetentionConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.interval, config.max_age))
    }

    pub fn with_target(mut self, target: Arc<dyn Retention>) -> Self {
        self.targets.push(target);
        self
    }

    /// One pass over all targets. Returns the total number of removed jobs.
    pub async fn sweep_once(&self) -> usize {
        let mut removed = 0;
        for target in &self.targets {
            let n = target.cleanup_older_than(self.max_age).await;
            if n > 0 {
                tracing::info!(kind = target.kind(), removed = n, "Retention sweep removed jobs");
            }
            removed += n;
        }
        removed
    }

    /// Sweep at every interval tick until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Retention sweeper stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
            }
        }
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub const PROGRESS_FILE: &str = "progress.json";
pub const LOG_FILE: &str = "scan.log";

/// Progress the external tool reports in its side file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSnapshot {
    pub stage: String,
    pub progress: u32,
    pub status: String,
    pub phase: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Progress(ProgressSnapshot),
    Log(String),
}

/// Read the progress side file of a run directory.
pub async fn read_progress(dir: &Path) -> Result<ProgressSnapshot> {
    let content = tokio::fs::read(dir.join(PROGRESS_FILE)).await?;
    let snapshot = serde_json::from_slice(super::strip_bom(&content))?;
    Ok(snapshot)
}

/// Read the log side file of a run directory, empty when absent.
pub async fn read_log(dir: &Path) -> String {
    tokio::fs::read_to_string(dir.join(LOG_FILE))
        .await
        .unwrap_or_default()
}

/// Polls the side files of one run directory and forwards changed values.
pub(crate) struct ProgressMonitor {
    dir: PathBuf,
    interval: Duration,
}

impl ProgressMonitor {
    pub(crate) fn new(dir: PathBuf, interval: Duration) -> Self {
        Self { dir, interval }
    }

    pub(crate) async fn run(self, tx: mpsc::Sender<ProgressEvent>, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        let mut last_progress: Option<(u32, String)> = None;
        let mut last_log = String::new();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tx.closed() => break,
                _ = interval.tick() => {}
            }

            if let Ok(snapshot) = read_progress(&self.dir).await {
                let key = (snapshot.progress, snapshot.stage.clone());
                if last_progress.as_ref() != Some(&key) {
                    last_progress = Some(key);
                    if tx.send(ProgressEvent::Progress(snapshot)).await.is_err() {
                        break;
                    }
                }
            }

            let log = read_log(&self.dir).await;
            if !log.is_empty() && log != last_log {
                last_log = log.clone();
                if tx.send(ProgressEvent::Log(log)).await.is_err() {
                    break;
                }
            }
        }
    }
}

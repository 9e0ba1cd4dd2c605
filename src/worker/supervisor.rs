use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Spawn one job task.
///
/// The task reports progress by mutating its job record. An `Err` return or
/// a panic inside `fut` is handed to `on_fault` as a message so the owner can
/// move the job to its error phase; neither escapes the task.
pub fn spawn_supervised<F, H, HF>(
    kind: &'static str,
    job_id: String,
    fut: F,
    on_fault: H,
) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
    H: FnOnce(String) -> HF + Send + 'static,
    HF: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let message = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {
                tracing::debug!(kind, job_id = %job_id, "Job task finished");
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("Internal error: {}", panic_message(panic.as_ref())),
        };

        tracing::error!(kind, job_id = %job_id, error = %message, "Job failed");
        on_fault(message).await;
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DittoError;
    use tokio::sync::oneshot;

    async fn run_to_fault<F>(fut: F) -> Option<String>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = spawn_supervised("test", "t_1".to_string(), fut, move |msg| async move {
            let _ = tx.send(msg);
        });
        handle.await.unwrap();
        rx.await.ok()
    }

    #[tokio::test]
    async fn success_does_not_report_fault() {
        assert!(run_to_fault(async { Ok(()) }).await.is_none());
    }

    #[tokio::test]
    async fn error_is_reported_with_display_text() {
        let msg = run_to_fault(async { Err(DittoError::Timeout("too slow".to_string())) })
            .await
            .unwrap();
        assert_eq!(msg, "Timed out: too slow");
    }

    #[tokio::test]
    async fn panic_is_converted_to_internal_error() {
        let msg = run_to_fault(async {
            if true {
                panic!("boom");
            }
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(msg, "Internal error: boom");
    }

    #[tokio::test]
    async fn formatted_panic_message_is_kept() {
        let msg = run_to_fault(async {
            let n = 3;
            if n > 0 {
                panic!("bad value {}", n);
            }
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(msg, "Internal error: bad value 3");
    }
}

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Attempts made by `retry_on_conflict`
pub const CONFLICT_ATTEMPTS: u32 = 3;

/// Pause between conflicting attempts
pub const CONFLICT_BACKOFF: Duration = Duration::from_millis(100);

/// Run a read-modify-write cycle, repeating it when the update loses an
/// optimistic concurrency race.
///
/// `op` must re-read the object on every call. Errors other than
/// `ClusterError::Conflict` are returned immediately.
pub async fn retry_on_conflict<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < CONFLICT_ATTEMPTS => {
                debug!(attempt, "Conflict updating {}, retrying", what);
                attempt += 1;
                tokio::time::sleep(CONFLICT_BACKOFF).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_conflicts_then_succeeds() {
        let calls = &AtomicU32::new(0);
        let result = retry_on_conflict("node n1", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ClusterError::conflict("node", "n1"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_three_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict("node n1", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ClusterError::conflict("node", "n1"))
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), CONFLICT_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict("pv1", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ClusterError::not_found("persistentvolume", "pv1"))
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

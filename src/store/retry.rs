// Retry for SQLite writes that lose a race for the database lock
// Backoff doubles from 100ms.
use std::time::Duration;
use tokio::time::sleep;

/// Retry a database operation with exponential backoff.
///
/// Only lock contention and I/O failures are retried; constraint violations
/// and decode errors are returned immediately.
pub async fn retry_db_operation<F, T, Fut>(
    mut operation: F,
    max_retries: u32,
    description: &str,
) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut retries = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if retries > 0 {
                    tracing::info!(
                        "Database operation '{}' succeeded after {} retries",
                        description,
                        retries
                    );
                }
                return Ok(result);
            }
            Err(e) if retries < max_retries && is_transient(&e) => {
                retries += 1;
                let backoff_ms = 50 * (1u64 << retries);

                tracing::warn!(
                    "Database operation '{}' failed (attempt {}/{}): {}. Retrying in {}ms",
                    description,
                    retries,
                    max_retries + 1,
                    e,
                    backoff_ms
                );

                sleep(Duration::from_millis(backoff_ms)).await;
            }
            Err(e) => {
                if retries > 0 {
                    tracing::error!(
                        "Database operation '{}' failed after {} retries: {}",
                        description,
                        retries,
                        e
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Busy/locked databases and I/O hiccups are worth another attempt
fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message().to_ascii_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_immediately() {
        let result = retry_db_operation(
            || async { Ok::<i32, sqlx::Error>(42) },
            5,
            "load_department",
        )
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempt_counter = Arc::new(AtomicU32::new(0));
        let counter_clone = attempt_counter.clone();

        let result = retry_db_operation(
            || {
                let counter = counter_clone.clone();
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(sqlx::Error::Io(std::io::Error::other("database is locked")))
                    } else {
                        Ok(100)
                    }
                }
            },
            5,
            "update_department",
        )
        .await;

        assert_eq!(result.unwrap(), 100);
        assert_eq!(attempt_counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = retry_db_operation(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let io = std::io::Error::other("disk I/O error");
                    Err::<i32, sqlx::Error>(sqlx::Error::Io(io))
                }
            },
            2,
            "clear_department",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_errors_fail_fast() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = retry_db_operation(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, sqlx::Error>(sqlx::Error::RowNotFound)
                }
            },
            5,
            "get_department",
        )
        .await;

        assert!(matches!(result, Err(sqlx::Error::RowNotFound)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}

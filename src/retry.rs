use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use crate::config::RetryConfig;
use crate::export::health::HealthMetrics;

/// Exponential backoff with jitter for remote page fetches.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl RetryPolicy {
    pub fn new(cfg: &RetryConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: cfg.initial_backoff,
            health,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .with_jitter()
    }

    /// Run `op` until it succeeds or `max_attempts` is exhausted.
    ///
    /// The delay doubles after every failed attempt, plus random jitter.
    /// The last error is returned as-is.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = op
            .retry(self.backoff())
            .sleep(tokio::time::sleep)
            .notify(|e: &anyhow::Error, wait: Duration| {
                self.observe(operation, "retry");
                debug!(
                    operation,
                    wait = ?wait,
                    error = %e,
                    "remote call failed, retrying",
                );
            })
            .await;

        self.observe(operation, if result.is_ok() { "ok" } else { "error" });
        result
    }

    fn observe(&self, operation: &str, status: &str) {
        if let Some(health) = &self.health {
            health
                .remote_requests_total
                .with_label_values(&[operation, status])
                .inc();
            if status == "retry" {
                health
                    .remote_retries_total
                    .with_label_values(&[operation])
                    .inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            &RetryConfig {
                max_attempts,
                initial_backoff: Duration::from_millis(1),
            },
            None,
        )
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let value = policy(3)
            .run("list_metrics", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("throttled");
                }
                Ok(42)
            })
            .await
            .expect("third attempt should succeed");

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let err = policy(2)
            .run("get_resources", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("unavailable"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "unavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_records_outcomes() {
        let health = Arc::new(HealthMetrics::new(":0").expect("health metrics"));
        let policy = RetryPolicy::new(
            &RetryConfig {
                max_attempts: 2,
                initial_backoff: Duration::ZERO,
            },
            Some(Arc::clone(&health)),
        );

        let calls = &AtomicU32::new(0);
        policy
            .run("get_metric_data", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("throttled");
                }
                Ok(())
            })
            .await
            .expect("retry should succeed");

        let retries = health
            .remote_retries_total
            .with_label_values(&["get_metric_data"])
            .get();
        let ok = health
            .remote_requests_total
            .with_label_values(&["get_metric_data", "ok"])
            .get();
        assert_eq!(retries, 1.0);
        assert_eq!(ok, 1.0);
    }

    #[tokio::test]
    async fn test_single_attempt_does_not_retry() {
        let calls = &AtomicU32::new(0);
        let health = Arc::new(HealthMetrics::new(":0").expect("health metrics"));
        let policy = RetryPolicy::new(
            &RetryConfig {
                max_attempts: 1,
                initial_backoff: Duration::from_secs(60),
            },
            Some(Arc::clone(&health)),
        );

        let err = policy
            .run("list_metrics", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("throttled"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "throttled");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let failed = health
            .remote_requests_total
            .with_label_values(&["list_metrics", "error"])
            .get();
        assert_eq!(failed, 1.0);
    }
}

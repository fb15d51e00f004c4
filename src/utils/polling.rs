/// Bounded fixed-interval waits, used to confirm asynchronous deletions
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// How long to wait, how often to look, and what to log while waiting
pub struct PollingConfig {
    pub timeout: Duration,
    pub interval: Duration,
    pub description: String,
}

impl PollingConfig {
    pub fn new(timeout_secs: u64, interval_secs: u64, description: impl Into<String>) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            interval: Duration::from_secs(interval_secs),
            description: description.into(),
        }
    }

    /// Call `condition` every `interval` until it yields a value.
    ///
    /// `Ok(None)` means the timeout elapsed first; the caller decides which
    /// error that is. An error from `condition` stops the wait immediately.
    pub async fn poll<F, Fut, T, E>(&self, condition: F) -> Result<Option<T>, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        info!("{}...", self.description);

        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!("{}: attempt {}", self.description, attempt);

            if let Some(value) = condition().await? {
                info!("✓ {}", self.description);
                return Ok(Some(value));
            }

            if start.elapsed() > self.timeout {
                return Ok(None);
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// Poll until condition returns Ok(true) or timeout
    ///
    /// Boolean form of [`poll`](Self::poll); `Ok(false)` on timeout
    pub async fn poll_until<F, Fut, E>(&self, condition: F) -> Result<bool, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let condition = &condition;
        let outcome = self
            .poll(move || async move {
                match condition().await {
                    Ok(true) => Ok(Some(())),
                    Ok(false) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(outcome.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_poll_returns_first_value() {
        let listings = Arc::new(AtomicU32::new(0));
        let seen = listings.clone();
        let started = Instant::now();

        let result = PollingConfig::new(10, 1, "Waiting for listing to drain")
            .poll(|| {
                let seen = seen.clone();
                async move {
                    let n = seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>((n == 2).then_some("gone"))
                }
            })
            .await;

        assert_eq!(result.unwrap(), Some("gone"));
        assert_eq!(listings.load(Ordering::SeqCst), 3);
        // Two sleeps of one second between the three checks
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_timeout() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let config = PollingConfig::new(2, 1, "test timeout");

        let result = config
            .poll(|| {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<Option<()>, std::io::Error>(None)
                }
            })
            .await;

        assert_eq!(result.unwrap(), None);
        // One check per second until the bound is passed
        let checks = counter.load(Ordering::SeqCst);
        assert!((3..=4).contains(&checks), "unexpected check count {checks}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_error_stops() {
        let config = PollingConfig::new(10, 1, "test error");

        let result = config
            .poll(|| async { Err::<Option<()>, _>("listing failed") })
            .await;

        assert_eq!(result.unwrap_err(), "listing failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let config = PollingConfig::new(10, 1, "test poll_until");

        let result = config
            .poll_until(|| {
                let c = counter_clone.clone();
                async move {
                    let val = c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(val >= 2)
                }
            })
            .await;

        assert!(result.unwrap());
    }
}

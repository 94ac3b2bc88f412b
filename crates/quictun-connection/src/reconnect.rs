//! Setup retry backoff

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backoff applied between failed session setups
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// None retries forever
    pub max_attempts: Option<usize>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BackoffError {
    #[error("Gave up after {0} setup attempts")]
    MaxAttemptsReached(usize),

    #[error("Shutdown requested while waiting to retry")]
    Cancelled,
}

/// Exponential backoff, reset once a session gets going
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
            attempt: 0,
        }
    }

    /// Sleep for the current delay, then grow it
    ///
    /// Returns early with `Cancelled` when `cancel` fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), BackoffError> {
        self.attempt += 1;
        if let Some(max) = self.config.max_attempts {
            if self.attempt > max {
                return Err(BackoffError::MaxAttemptsReached(max));
            }
        }

        debug!(
            "Waiting {:?} before setup attempt {}",
            self.current,
            self.attempt + 1
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(BackoffError::Cancelled),
            _ = sleep(self.current) => {}
        }

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.config.multiplier);
        self.current = next.min(self.config.max);
        Ok(())
    }

    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting setup backoff");
        }
        self.current = self.config.initial;
        self.attempt = 0;
    }

    /// Failed attempts since the last reset
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Delay the next `wait` will sleep for
    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_and_caps() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::new(fast());

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current(), Duration::from_millis(10));

        let expected = [20, 40, 80, 100, 100];
        for (i, ms) in expected.iter().enumerate() {
            backoff.wait(&cancel).await.unwrap();
            assert_eq!(backoff.attempt(), i + 1);
            assert_eq!(backoff.current(), Duration::from_millis(*ms));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::new(fast());

        backoff.wait(&cancel).await.unwrap();
        backoff.wait(&cancel).await.unwrap();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::new(BackoffConfig {
            max_attempts: Some(2),
            ..fast()
        });

        assert!(backoff.wait(&cancel).await.is_ok());
        assert!(backoff.wait(&cancel).await.is_ok());
        assert!(matches!(
            backoff.wait(&cancel).await,
            Err(BackoffError::MaxAttemptsReached(2))
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_secs(60),
            ..fast()
        });

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), backoff.wait(&cancel))
            .await
            .expect("wait ignored cancellation");
        assert!(matches!(result, Err(BackoffError::Cancelled)));
    }
}

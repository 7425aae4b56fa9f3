//! Exponential backoff with jitter.
//!
//! One policy serves every retry site: hydrations, upload chunks,
//! upload session creation, and offline journal replay. Delays start
//! at 1s, double per attempt, cap at 30s, and carry ±10% jitter; a
//! transient failure is retried at most 5 times.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use onemount_core::ports::RemoteError;
use onemount_core::CoreError;

/// Retry policy parameters.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    /// Jitter fraction applied symmetrically (0.1 = ±10%).
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.1,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.cap.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Runs `op` until it succeeds, fails non-transiently, exhausts the
    /// attempt budget, or the token is cancelled.
    ///
    /// A 429 with a `Retry-After` hint sleeps for the hint when it is
    /// longer than the computed delay.
    pub async fn retry<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let mut delay = self.delay(attempt);
                    if let RemoteError::RateLimited {
                        retry_after_secs: Some(hint),
                    } = e
                    {
                        delay = delay.max(Duration::from_secs(hint));
                    }
                    debug!(
                        %what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

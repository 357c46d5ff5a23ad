//! Eventual poller: retry a condition at a fixed interval until it holds or
//! a deadline passes.
//!
//! Every check runs once immediately, so a condition that already holds
//! returns without sleeping. Timing uses `tokio::time`, which keeps the
//! poller deterministic under a paused test clock.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// The condition never held within the deadline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("condition not met within {timeout:?} ({attempts} checks over {elapsed:?})")]
pub struct Timeout {
    pub timeout: Duration,
    pub elapsed: Duration,
    pub attempts: u32,
}

/// Outcome of [`Poller::try_until`] when it does not succeed.
#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    /// The check never produced a value in time.
    #[error(transparent)]
    Timeout(Timeout),
    /// The check itself failed; polling stopped at that point.
    #[error("check failed: {0}")]
    Check(E),
}

/// The condition stopped holding during a [`Poller::consistently`] window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("condition failed after {elapsed:?} (check {attempt})")]
pub struct Violation {
    pub elapsed: Duration,
    pub attempt: u32,
}

/// Poll configuration: total budget and spacing between checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for Poller {
    /// Ten seconds at 100ms, the budget used for agent log waits.
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_millis(100))
    }
}

impl Poller {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Poll until `check` returns `true`.
    pub async fn until<F, Fut>(&self, mut check: F) -> Result<(), Timeout>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        self.until_some(|| {
            let fut = check();
            async move { fut.await.then_some(()) }
        })
        .await
    }

    /// Poll until `check` yields a value.
    pub async fn until_some<T, F, Fut>(&self, mut check: F) -> Result<T, Timeout>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let result = self
            .try_until(|| {
                let fut = check();
                async move { Ok::<_, std::convert::Infallible>(fut.await) }
            })
            .await;
        match result {
            Ok(value) => Ok(value),
            Err(PollError::Timeout(t)) => Err(t),
            Err(PollError::Check(never)) => match never {},
        }
    }

    /// Poll until `check` yields a value, stopping early if it errors.
    pub async fn try_until<T, E, F, Fut>(&self, mut check: F) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(value) = check().await.map_err(PollError::Check)? {
                return Ok(value);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PollError::Timeout(Timeout {
                    timeout: self.timeout,
                    elapsed: now - start,
                    attempts,
                }));
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }

    /// Require `check` to hold at every sample for the whole window.
    pub async fn consistently<F, Fut>(&self, mut check: F) -> Result<(), Violation>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if !check().await {
                return Err(Violation {
                    elapsed: start.elapsed(),
                    attempt,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }

    /// Poll `fetch` until its output contains `needle`.
    pub async fn output_contains<F, Fut>(&self, fetch: F, needle: &str) -> Result<String, Timeout>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = String>,
    {
        self.output_matching(fetch, |out| out.contains(needle)).await
    }

    /// Poll `fetch` until its output no longer contains `needle`.
    pub async fn output_lacks<F, Fut>(&self, fetch: F, needle: &str) -> Result<String, Timeout>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = String>,
    {
        self.output_matching(fetch, |out| !out.contains(needle)).await
    }

    async fn output_matching<F, Fut, P>(&self, mut fetch: F, pred: P) -> Result<String, Timeout>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = String>,
        P: Fn(&str) -> bool + Copy,
    {
        self.until_some(|| {
            let fut = fetch();
            async move {
                let out = fut.await;
                pred(&out).then_some(out)
            }
        })
        .await
    }
}

/// Free-function form: `check` every `interval` until it holds or
/// `timeout` passes.
pub async fn eventually<F, Fut>(check: F, timeout: Duration, interval: Duration) -> Result<(), Timeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    Poller::new(timeout, interval).until(check).await
}

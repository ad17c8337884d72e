//! Bounded retry with exponential backoff, and the online/offline signal.
//!
//! Every fetch runs through a [`Retryer`]: one asynchronous attempt at a
//! time, bounded retries with capped exponential backoff and jitter, a
//! cooperative [`CancellationToken`], and automatic pause/resume driven by
//! the [`OnlineState`] network signal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::state::SharedError;

/// Backoff policy for failed fetch attempts.
///
/// The delay before retry `n` (1-based) is
/// `min(base_delay * 2^(n-1), max_delay)`, multiplied by a uniform random
/// factor in `[1 - jitter, 1]`. Defaults to 3 retries, 1s base, 30s cap and
/// 0.25 jitter; all four knobs are public.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first failure. `0` fails on the first rejection.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for the exponential curve.
    pub max_delay: Duration,
    /// Fraction of the delay that may be randomly shaved off, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries. Mutations use this: side effects are not
    /// safely idempotent without caller opt-in.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff delay after `failure_count` consecutive failures (1-based).
    pub fn delay_for(&self, failure_count: u32) -> Duration {
        let exponent = failure_count.saturating_sub(1).min(31);
        let uncapped = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = uncapped.min(self.max_delay);
        if self.jitter <= 0.0 {
            return capped;
        }
        let factor = 1.0 - self.jitter.clamp(0.0, 1.0) * rand::random::<f64>();
        capped.mul_f64(factor)
    }
}

/// Shared online/offline signal.
///
/// The client owns one of these; every retryer watches it. Going offline
/// pauses in-flight fetch loops before their next attempt; coming back online
/// resumes them without counting a failure.
#[derive(Clone)]
pub struct OnlineState {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for OnlineState {
    fn default() -> Self {
        Self::new()
    }
}

impl OnlineState {
    /// New signal, initially online.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    /// Flip the signal.
    pub fn set_online(&self, online: bool) {
        self.tx.send_replace(online);
    }

    /// Current value.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal is (or becomes) online.
    pub async fn wait_online(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so this cannot fail.
        let _ = rx.wait_for(|online| *online).await;
    }
}

/// Progress events emitted while a retry loop runs.
pub(crate) enum RetryEvent {
    /// An attempt rejected; `failure_count` is 1-based.
    Failed {
        failure_count: u32,
        error: SharedError,
    },
    /// Offline: the loop is parked until the signal flips.
    Paused,
    /// Back online.
    Resumed,
}

/// Terminal outcome of a retry loop.
pub(crate) enum RetryOutcome<T> {
    /// An attempt resolved.
    Resolved(T),
    /// Retry budget spent; last error attached.
    Failed(SharedError),
    /// The cancellation token fired.
    Cancelled,
}

/// Executes one asynchronous operation with bounded retry and cooperative
/// cancellation.
pub(crate) struct Retryer {
    pub policy: RetryPolicy,
    pub cancel: CancellationToken,
    pub online: OnlineState,
}

impl Retryer {
    /// Drive `attempt` to a terminal outcome.
    ///
    /// `attempt` is called once per try with the cancellation token, which it
    /// may pass down or ignore; an attempt that ignores it is simply dropped
    /// when cancellation wins the race. `on_event` observes pauses, resumes
    /// and failures as they happen.
    pub async fn run<T, F, Fut>(
        &self,
        mut attempt: F,
        mut on_event: impl FnMut(RetryEvent),
    ) -> RetryOutcome<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        let mut failures = 0u32;
        loop {
            if !self.online.is_online() {
                on_event(RetryEvent::Paused);
                tokio::select! {
                    _ = self.cancel.cancelled() => return RetryOutcome::Cancelled,
                    _ = self.online.wait_online() => on_event(RetryEvent::Resumed),
                }
            }

            let fut = attempt(self.cancel.clone());
            tokio::select! {
                _ = self.cancel.cancelled() => return RetryOutcome::Cancelled,
                result = fut => match result {
                    Ok(value) => return RetryOutcome::Resolved(value),
                    Err(error) => {
                        failures += 1;
                        let error: SharedError = Arc::new(error);
                        on_event(RetryEvent::Failed {
                            failure_count: failures,
                            error: error.clone(),
                        });
                        if failures > self.policy.max_retries {
                            return RetryOutcome::Failed(error);
                        }
                        let delay = self.policy.delay_for(failures);
                        trace!(failures, ?delay, "fetch attempt failed, backing off");
                        tokio::select! {
                            _ = self.cancel.cancelled() => return RetryOutcome::Cancelled,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(policy: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..policy
        }
    }

    #[test]
    fn test_backoff_curve_doubles_and_caps() {
        let policy = no_jitter(RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            ..RetryPolicy::default()
        });
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30)); // capped
        assert_eq!(policy.delay_for(31), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(4),
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(4));
        }
    }

    #[tokio::test]
    async fn test_resolves_on_first_success() {
        let retryer = Retryer {
            policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            online: OnlineState::new(),
        };
        let outcome = retryer.run(|_| async { Ok::<_, anyhow::Error>(42) }, |_| {}).await;
        assert!(matches!(outcome, RetryOutcome::Resolved(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_budget_spent() {
        let attempts = AtomicU32::new(0);
        let retryer = Retryer {
            policy: no_jitter(RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                ..RetryPolicy::default()
            }),
            cancel: CancellationToken::new(),
            online: OnlineState::new(),
        };
        let outcome: RetryOutcome<i32> = retryer
            .run(
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(anyhow::anyhow!("nope")) }
                },
                |_| {},
            )
            .await;
        assert!(matches!(outcome, RetryOutcome::Failed(_)));
        // 1 initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_wins_the_race() {
        let cancel = CancellationToken::new();
        let retryer = Retryer {
            policy: RetryPolicy::default(),
            cancel: cancel.clone(),
            online: OnlineState::new(),
        };
        cancel.cancel();
        let outcome: RetryOutcome<i32> = retryer
            .run(
                |_| async {
                    futures::future::pending::<()>().await;
                    Ok(0)
                },
                |_| {},
            )
            .await;
        assert!(matches!(outcome, RetryOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_offline_pauses_and_resumes_without_failure() {
        let online = OnlineState::new();
        online.set_online(false);
        let retryer = Retryer {
            policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            online: online.clone(),
        };

        let resumer = {
            let online = online.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                online.set_online(true);
            })
        };

        let mut paused = false;
        let mut resumed = false;
        let outcome = retryer
            .run(
                |_| async { Ok::<_, anyhow::Error>(7) },
                |event| match event {
                    RetryEvent::Paused => paused = true,
                    RetryEvent::Resumed => resumed = true,
                    RetryEvent::Failed { .. } => panic!("offline wait must not count as failure"),
                },
            )
            .await;
        resumer.await.unwrap();
        assert!(matches!(outcome, RetryOutcome::Resolved(7)));
        assert!(paused && resumed);
    }
}

//! Bounded retries with exponential, linear or constant backoff.
//!
//! Attempts are 1-indexed. The delay slept after a failed attempt `a` is
//!
//! - exponential: `min_time * 2^(a-1)`
//! - linear: `min_time * a`
//! - constant: `min_time`
//!
//! always clamped to `[min_time, max_time]`. A missing policy or one with
//! `max_attempts <= 1` runs the attempt once with no retry events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cancellation::CancellationToken;
use crate::core::RunEvent;
use crate::errors::{CompileError, UnitError};
use crate::events::EventSink;

/// Default lower bound on the retry delay.
pub const DEFAULT_MIN_TIME: Duration = Duration::from_millis(1000);

/// Default upper bound on the retry delay.
pub const DEFAULT_MAX_TIME: Duration = Duration::from_millis(30_000);

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// delay = min * 2^(attempt-1)
    #[default]
    Exponential,
    /// delay = min * attempt
    Linear,
    /// delay = min
    Constant,
}

impl fmt::Display for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exponential => write!(f, "exponential"),
            Self::Linear => write!(f, "linear"),
            Self::Constant => write!(f, "constant"),
        }
    }
}

/// A retry policy attached to a workflow, job or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff strategy.
    #[serde(default)]
    pub backoff: Backoff,

    /// Lower delay bound.
    #[serde(rename = "min_time_ms", with = "duration_ms", default = "default_min_time")]
    pub min_time: Duration,

    /// Upper delay bound.
    #[serde(rename = "max_time_ms", with = "duration_ms", default = "default_max_time")]
    pub max_time: Duration,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_time() -> Duration {
    DEFAULT_MIN_TIME
}

fn default_max_time() -> Duration {
    DEFAULT_MAX_TIME
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            min_time: DEFAULT_MIN_TIME,
            max_time: DEFAULT_MAX_TIME,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with `max_attempts` and default timing.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the lower delay bound.
    #[must_use]
    pub fn with_min_time(mut self, min_time: Duration) -> Self {
        self.min_time = min_time;
        self
    }

    /// Sets the upper delay bound.
    #[must_use]
    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }

    /// Returns true if the policy actually retries.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 1
    }

    /// Returns the delay to sleep after failed attempt `attempt` (1-indexed).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.backoff {
            Backoff::Exponential => self
                .min_time
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
            Backoff::Linear => self.min_time.saturating_mul(attempt),
            Backoff::Constant => self.min_time,
        };
        raw.max(self.min_time).min(self.max_time)
    }

    /// Checks the policy is well-formed.
    pub fn validate(&self, scope: &str) -> Result<(), CompileError> {
        if self.max_attempts == 0 {
            return Err(CompileError::InvalidRetryPolicy {
                scope: scope.to_string(),
                reason: "max_attempts must be at least 1".to_string(),
            });
        }
        if self.min_time > self.max_time {
            return Err(CompileError::InvalidRetryPolicy {
                scope: scope.to_string(),
                reason: format!(
                    "min_time ({}ms) exceeds max_time ({}ms)",
                    self.min_time.as_millis(),
                    self.max_time.as_millis()
                ),
            });
        }
        Ok(())
    }

    /// Picks the most specific policy: step, then job, then workflow.
    #[must_use]
    pub fn resolve(
        step: Option<&Self>,
        job: Option<&Self>,
        workflow: Option<&Self>,
    ) -> Option<Self> {
        step.or(job).or(workflow).copied()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Where a retried operation runs and reports to.
pub struct RetryContext<'a> {
    /// Event label, usually `job/step`.
    pub label: &'a str,
    /// Unit name used in errors.
    pub unit: &'a str,
    /// Receives retry events.
    pub sink: &'a dyn EventSink,
    /// Interrupts back-off sleeps.
    pub cancel: &'a CancellationToken,
    /// Per-attempt timeout.
    pub timeout: Option<Duration>,
}

/// The result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome {
    /// How many attempts ran.
    pub attempts: u32,
    /// The final attempt's result.
    pub result: Result<(), UnitError>,
}

/// Runs `attempt_fn` under `policy`.
///
/// `attempt_fn` receives the 1-indexed attempt number. Cancelled attempts
/// are never retried.
pub async fn run_with_retry<F, Fut>(
    policy: Option<&RetryPolicy>,
    ctx: RetryContext<'_>,
    mut attempt_fn: F,
) -> RetryOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), UnitError>>,
{
    let Some(policy) = policy.filter(|p| p.is_enabled()) else {
        let result = run_attempt(&ctx, attempt_fn(1)).await;
        return RetryOutcome {
            attempts: 1,
            result,
        };
    };

    let mut attempt = 1;
    loop {
        ctx.sink
            .emit(RunEvent::retry_attempt(
                ctx.label,
                attempt,
                policy.max_attempts,
                policy.backoff,
            ))
            .await;

        let result = run_attempt(&ctx, attempt_fn(attempt)).await;
        let err = match result {
            Ok(()) => {
                return RetryOutcome {
                    attempts: attempt,
                    result: Ok(()),
                }
            }
            Err(err) if err.is_cancelled() => {
                return RetryOutcome {
                    attempts: attempt,
                    result: Err(err),
                }
            }
            Err(err) => err,
        };

        if attempt >= policy.max_attempts {
            warn!(label = ctx.label, attempts = attempt, error = %err, "Retries exhausted");
            ctx.sink
                .emit(RunEvent::retry_exhausted(ctx.label, attempt, policy.backoff))
                .await;
            return RetryOutcome {
                attempts: attempt,
                result: Err(err),
            };
        }

        let delay = policy.delay(attempt);
        debug!(
            label = ctx.label,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Attempt failed, retrying"
        );
        ctx.sink
            .emit(RunEvent::retry_scheduled(ctx.label, attempt, delay, policy.backoff))
            .await;

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = ctx.cancel.cancelled() => {
                return RetryOutcome {
                    attempts: attempt,
                    result: Err(UnitError::Cancelled { unit: ctx.unit.to_string() }),
                };
            }
        }
        attempt += 1;
    }
}

async fn run_attempt<Fut>(ctx: &RetryContext<'_>, fut: Fut) -> Result<(), UnitError>
where
    Fut: Future<Output = Result<(), UnitError>>,
{
    match ctx.timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(UnitError::TimedOut {
                unit: ctx.unit.to_string(),
                timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })
        }),
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn failing(unit: &str) -> UnitError {
        UnitError::NonZeroExit {
            unit: unit.to_string(),
            exit_code: Some(1),
            stderr: String::new(),
        }
    }

    fn ctx<'a>(sink: &'a CollectingEventSink, cancel: &'a CancellationToken) -> RetryContext<'a> {
        RetryContext {
            label: "build/compile",
            unit: "compile",
            sink,
            cancel,
            timeout: None,
        }
    }

    #[test]
    fn test_exponential_delay() {
        let policy = RetryPolicy::new(5)
            .with_min_time(Duration::from_millis(100))
            .with_max_time(Duration::from_millis(1000));

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1000));
    }

    #[test]
    fn test_linear_and_constant_delay() {
        let linear = RetryPolicy::new(3)
            .with_backoff(Backoff::Linear)
            .with_min_time(Duration::from_millis(50))
            .with_max_time(Duration::from_millis(120));
        assert_eq!(linear.delay(1), Duration::from_millis(50));
        assert_eq!(linear.delay(2), Duration::from_millis(100));
        assert_eq!(linear.delay(3), Duration::from_millis(120));

        let constant = linear.with_backoff(Backoff::Constant);
        assert_eq!(constant.delay(1), constant.delay(9));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(u32::MAX), DEFAULT_MAX_TIME);
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::new(1).validate("job 'a'").is_ok());
        assert!(RetryPolicy::new(0).validate("job 'a'").is_err());

        let inverted = RetryPolicy::new(2)
            .with_min_time(Duration::from_secs(5))
            .with_max_time(Duration::from_secs(1));
        let err = inverted.validate("step 'x'").unwrap_err();
        assert!(err.to_string().contains("exceeds max_time"));
    }

    #[test]
    fn test_resolve_precedence() {
        let step = RetryPolicy::new(4);
        let job = RetryPolicy::new(3);
        let wf = RetryPolicy::new(2);

        assert_eq!(RetryPolicy::resolve(Some(&step), Some(&job), Some(&wf)), Some(step));
        assert_eq!(RetryPolicy::resolve(None, Some(&job), Some(&wf)), Some(job));
        assert_eq!(RetryPolicy::resolve(None, None, Some(&wf)), Some(wf));
        assert_eq!(RetryPolicy::resolve(None, None, None), None);
    }

    #[test]
    fn test_policy_json_uses_millis() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts": 4, "backoff": "linear", "min_time_ms": 10, "max_time_ms": 40}"#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff, Backoff::Linear);
        assert_eq!(policy.min_time, Duration::from_millis(10));
        assert_eq!(policy.max_time, Duration::from_millis(40));
    }

    proptest! {
        #[test]
        fn prop_delay_within_bounds_and_monotonic(
            min_ms in 0u64..5_000,
            span_ms in 0u64..60_000,
            attempt in 1u32..64,
            backoff in prop_oneof![
                Just(Backoff::Exponential),
                Just(Backoff::Linear),
                Just(Backoff::Constant)
            ],
        ) {
            let policy = RetryPolicy::new(10)
                .with_backoff(backoff)
                .with_min_time(Duration::from_millis(min_ms))
                .with_max_time(Duration::from_millis(min_ms + span_ms));

            let d = policy.delay(attempt);
            prop_assert!(d >= policy.min_time);
            prop_assert!(d <= policy.max_time);

            let next = policy.delay(attempt + 1);
            if backoff == Backoff::Constant {
                prop_assert_eq!(d, next);
            } else {
                prop_assert!(next >= d);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_unit_runs_max_attempts_times() {
        let sink = CollectingEventSink::new();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(4).with_min_time(Duration::from_millis(10));

        let counter = Arc::clone(&calls);
        let outcome = run_with_retry(Some(&policy), ctx(&sink, &cancel), |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(failing("compile")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.attempts, 4);
        assert!(outcome.result.is_err());
        assert_eq!(sink.events_of_type("retry.attempt").len(), 4);
        assert_eq!(sink.events_of_type("retry.scheduled").len(), 3);
        assert_eq!(sink.events_of_type("retry.exhausted").len(), 1);

        let delays: Vec<u64> = sink
            .events_of_type("retry.scheduled")
            .iter()
            .filter_map(|e| e.u64_field("delay_ms"))
            .collect();
        assert_eq!(delays, vec![10, 20, 40]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failure() {
        let sink = CollectingEventSink::new();
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(3).with_min_time(Duration::from_millis(5));

        let outcome = run_with_retry(Some(&policy), ctx(&sink, &cancel), |attempt| async move {
            if attempt < 2 {
                Err(failing("compile"))
            } else {
                Ok(())
            }
        })
        .await;

        assert_eq!(outcome.attempts, 2);
        assert!(outcome.result.is_ok());
        assert!(sink.events_of_type("retry.exhausted").is_empty());
    }

    #[tokio::test]
    async fn test_single_attempt_emits_nothing() {
        let sink = CollectingEventSink::new();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let outcome = run_with_retry(Some(&RetryPolicy::new(1)), ctx(&sink, &cancel), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(failing("compile")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
        assert!(sink.is_empty());

        let outcome = run_with_retry(None, ctx(&sink, &cancel), |_| async { Ok(()) }).await;
        assert!(outcome.result.is_ok());
        assert!(sink.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let sink = CollectingEventSink::new();
        let cancel = CancellationToken::new();
        let mut context = ctx(&sink, &cancel);
        context.timeout = Some(Duration::from_millis(50));

        let outcome = run_with_retry(None, context, |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert!(matches!(outcome.result, Err(UnitError::TimedOut { timeout_ms: 50, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let sink = CollectingEventSink::new();
        let cancel = Arc::new(CancellationToken::new());
        let policy = RetryPolicy::new(5).with_min_time(Duration::from_secs(60));

        let trigger = Arc::clone(&cancel);
        let outcome = run_with_retry(
            Some(&policy),
            RetryContext {
                label: "build/compile",
                unit: "compile",
                sink: &sink,
                cancel: &cancel,
                timeout: None,
            },
            |_| {
                let trigger = Arc::clone(&trigger);
                async move {
                    trigger.cancel("test");
                    Err(failing("compile"))
                }
            },
        )
        .await;

        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(UnitError::Cancelled { .. })));
    }
}

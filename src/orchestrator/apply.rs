//! Bounded, cancellable retry of a single intent.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::{Ack, ApplyError, ClusterAdapter};
use crate::orchestrator::MutationIntent;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Applied(Ack),
    Failed { error: ApplyError, attempts: u32 },
    /// The owning state transition was preempted.
    Cancelled,
}

/// Apply `intent`, retrying retryable failures with backoff until the
/// policy is exhausted. Permanent failures return immediately.
pub async fn apply_with_retry(
    adapter: &dyn ClusterAdapter,
    intent: &MutationIntent,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> ApplyOutcome {
    let mut attempt = 0;
    loop {
        attempt += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => return ApplyOutcome::Cancelled,
            r = adapter.apply(intent) => r,
        };

        match result {
            Ok(ack) => {
                debug!(service = %intent.target, key = %intent.key, attempt, "Intent applied");
                return ApplyOutcome::Applied(ack);
            }
            Err(error) if error.retryable && policy.should_retry(attempt) => {
                let delay = policy.delay(attempt);
                warn!(
                    service = %intent.target,
                    key = %intent.key,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "Intent failed: {}", error
                );
                tokio::select! {
                    _ = cancel.cancelled() => return ApplyOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => {
                return ApplyOutcome::Failed {
                    error,
                    attempts: attempt,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{IdempotencyKey, SubsetWeight};
    use crate::report::ReportId;
    use crate::target::Target;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Adapter replaying a fixed list of results, then succeeding.
    struct Scripted {
        script: Mutex<VecDeque<Result<(), ApplyError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(script: Vec<Result<(), ApplyError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn next(&self, key: &IdempotencyKey) -> Result<Ack, ApplyError> {
            *self.calls.lock().unwrap() += 1;
            match self.script.lock().unwrap().pop_front() {
                Some(Err(e)) => Err(e),
                _ => Ok(Ack {
                    key: key.clone(),
                    already_applied: false,
                }),
            }
        }
    }

    #[async_trait::async_trait]
    impl ClusterAdapter for Scripted {
        async fn reweight_route(
            &self,
            _target: &str,
            _route: &str,
            _host: &str,
            _weights: &[SubsetWeight],
            key: &IdempotencyKey,
        ) -> Result<Ack, ApplyError> {
            self.next(key)
        }

        async fn scale_deployment(
            &self,
            _target: &str,
            _deployment: &str,
            _replicas: u32,
            key: &IdempotencyKey,
        ) -> Result<Ack, ApplyError> {
            self.next(key)
        }
    }

    fn intent() -> MutationIntent {
        let report = ReportId::for_window("ratings", Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap());
        crate::orchestrator::failover_intents(&Target::new("ratings"), &report).remove(0)
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_millis(100), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let adapter = Scripted::new(vec![
            Err(ApplyError::retryable("conflict")),
            Err(ApplyError::retryable("conflict")),
        ]);
        let outcome = apply_with_retry(&adapter, &intent(), &policy(), &CancellationToken::new()).await;
        assert!(matches!(outcome, ApplyOutcome::Applied(_)));
        assert_eq!(*adapter.calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let adapter = Scripted::new(vec![Err(ApplyError::retryable("down")); 5]);
        let outcome = apply_with_retry(&adapter, &intent(), &policy(), &CancellationToken::new()).await;
        match outcome {
            ApplyOutcome::Failed { attempts, error } => {
                assert_eq!(attempts, 3);
                assert!(error.retryable);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(*adapter.calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_short_circuits() {
        let adapter = Scripted::new(vec![Err(ApplyError::permanent("not found"))]);
        let outcome = apply_with_retry(&adapter, &intent(), &policy(), &CancellationToken::new()).await;
        assert!(matches!(outcome, ApplyOutcome::Failed { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let adapter = Scripted::new(vec![Err(ApplyError::retryable("down")); 5]);
        let cancel = CancellationToken::new();
        let slow = RetryPolicy::fixed(5, Duration::from_secs(60), Duration::from_secs(60));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let outcome = apply_with_retry(&adapter, &intent(), &slow, &cancel).await;
        assert!(matches!(outcome, ApplyOutcome::Cancelled));
        assert_eq!(*adapter.calls.lock().unwrap(), 1);
    }
}

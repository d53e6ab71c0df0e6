use crate::error::ToolError;

use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub const MAX_ATTEMPTS: u32 = 3;
pub const BASE_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    Terminal,
}

/// Whether another attempt could succeed where this one failed.
pub fn classify(error: &ToolError) -> Retryability {
    match error {
        ToolError::Timeout | ToolError::Connect(_) => Retryability::Retryable,
        ToolError::Status { status, .. } if *status == 429 || (500..=599).contains(status) => {
            Retryability::Retryable
        }
        _ => Retryability::Terminal,
    }
}

/// Delay after failed attempt `attempt` (1-based): 500ms, 1s, 2s, ...
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Time to run every attempt at `per_attempt` plus the backoff between them.
pub fn total_budget(per_attempt: Duration, base: Duration) -> Duration {
    (1..MAX_ATTEMPTS).fold(per_attempt * MAX_ATTEMPTS, |total, attempt| {
        total + backoff_delay(base, attempt)
    })
}

#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: ToolError,
}

/// Run `op` until it succeeds, fails terminally, or `max_attempts` is reached. Each call to `op`
/// receives its 1-based attempt number.
pub async fn with_retry<T, F, Fut>(
    max_attempts: u32,
    base: Duration,
    mut op: F,
) -> Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ToolError>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(error) => {
                if classify(&error) == Retryability::Terminal || attempt >= max_attempts {
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                    });
                }
                let delay = backoff_delay(base, attempt);
                warn!(error=%error, attempt, delay_ms=delay.as_millis() as u64, "retrying tool call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[test]
    fn classification() {
        assert_eq!(classify(&ToolError::Timeout), Retryability::Retryable);
        assert_eq!(
            classify(&ToolError::Connect("refused".into())),
            Retryability::Retryable
        );
        for status in [429, 500, 502, 503, 599] {
            let e = ToolError::Status {
                status,
                body: String::new(),
            };
            assert_eq!(classify(&e), Retryability::Retryable, "{status}");
        }
        for status in [400, 401, 404, 422] {
            let e = ToolError::Status {
                status,
                body: String::new(),
            };
            assert_eq!(classify(&e), Retryability::Terminal, "{status}");
        }
        assert_eq!(
            classify(&ToolError::UnknownTool("x".into())),
            Retryability::Terminal
        );
        assert_eq!(
            classify(&ToolError::InvalidArguments("x".into())),
            Retryability::Terminal
        );
        assert_eq!(
            classify(&ToolError::Dispatch(crate::error::DispatchError::InvalidRequest(
                "x".into()
            ))),
            Retryability::Terminal
        );
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(BASE_BACKOFF, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(BASE_BACKOFF, 2), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(BASE_BACKOFF, 3), Duration::from_millis(2_000));
    }

    #[test]
    fn budget_covers_attempts_and_backoff() {
        assert_eq!(
            total_budget(Duration::from_secs(10), BASE_BACKOFF),
            Duration::from_millis(31_500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn always_timing_out_is_attempted_three_times() {
        let started = Instant::now();
        let seen = Mutex::new(vec![]);
        let res: Result<(), _> = with_retry(MAX_ATTEMPTS, BASE_BACKOFF, |attempt| {
            seen.lock().unwrap().push((attempt, started.elapsed()));
            async { Err(ToolError::Timeout) }
        })
        .await;

        let failure = res.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert!(matches!(failure.error, ToolError::Timeout));
        let seen = seen.into_inner().unwrap();
        assert_eq!(
            seen,
            vec![
                (1, Duration::ZERO),
                (2, Duration::from_millis(500)),
                (3, Duration::from_millis(1_500)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = with_retry(MAX_ATTEMPTS, BASE_BACKOFF, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ToolError::Status {
                    status: 404,
                    body: "not found".into(),
                })
            }
        })
        .await;
        assert_eq!(res.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let res = with_retry(MAX_ATTEMPTS, BASE_BACKOFF, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(ToolError::Status {
                        status: 503,
                        body: String::new(),
                    })
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(res.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

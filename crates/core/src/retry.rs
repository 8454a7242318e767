//! Constant-interval retry for calls the control plane may transiently reject.

use std::future::Future;
use std::time::Duration;

/// Retry schedule. `max_attempts == 0` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn constant(interval: Duration) -> Self {
        Self { interval, max_attempts: 0 }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

impl Default for Backoff {
    fn default() -> Self { Self::constant(Duration::from_secs(1)) }
}

/// Run `op` until it succeeds. `notify` sees every failure that will be
/// retried, together with the wait before the next attempt. When attempts
/// are bounded, the last error is returned without a notification.
pub async fn retry_notify<F, Fut, T, E, N>(backoff: &Backoff, mut op: F, mut notify: N) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    N: FnMut(&E, Duration),
{
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if backoff.max_attempts > 0 && attempt >= backoff.max_attempts {
                    return Err(e);
                }
                notify(&e, backoff.interval);
                tokio::time::sleep(backoff.interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[tokio::test]
    async fn succeeds_after_failures_and_notifies_each() {
        let calls = Cell::new(0);
        let seen = RefCell::new(Vec::new());
        let backoff = Backoff::constant(Duration::from_millis(2));
        let out: Result<u32, String> = retry_notify(
            &backoff,
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { if n < 3 { Err(format!("fail {}", n)) } else { Ok(n) } }
            },
            |e, wait| seen.borrow_mut().push((e.clone(), wait)),
        )
        .await;
        assert_eq!(out.unwrap(), 3);
        let seen = seen.into_inner();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, wait)| *wait == Duration::from_millis(2)));
        assert_eq!(seen[0].0, "fail 1");
    }

    #[tokio::test]
    async fn bounded_attempts_return_last_error() {
        let calls = Cell::new(0);
        let notified = Cell::new(0);
        let backoff = Backoff::constant(Duration::from_millis(1)).with_max_attempts(3);
        let out: Result<(), String> = retry_notify(
            &backoff,
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { Err(format!("fail {}", n)) }
            },
            |_, _| notified.set(notified.get() + 1),
        )
        .await;
        assert_eq!(out.unwrap_err(), "fail 3");
        assert_eq!(calls.get(), 3);
        assert_eq!(notified.get(), 2);
    }
}

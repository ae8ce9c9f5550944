//! Bounded retry with exponential backoff, used by the Sync Engine around
//! downloads and sink sends. Not used inside the Source Adapter: its
//! own failover loop is a distinct retry shape.

use std::future::Future;
use std::time::Duration;

pub async fn retry<F, Fut, T, E>(
    max_retries: u32,
    base_delay: Duration,
    factor: f64,
    mut attempt_fn: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_retries {
                    return Err(err);
                }
                let delay = base_delay.mul_f64(factor.powi(attempt as i32));
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

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_exhausting_retries_is_an_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry(2, Duration::from_millis(1), 2.0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom") }
        })
        .await;
        assert_eq!(result, Err("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_success_without_retrying() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(2, Duration::from_millis(1), 2.0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_a_later_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(2, Duration::from_millis(1), 2.0, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("not yet") } else { Ok(7) } }
        })
        .await;
        assert_eq!(result, Ok(7));
    }
}

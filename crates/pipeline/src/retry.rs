//! Retry loop for storage calls that can fail on a transient error.

use std::fmt::Display;
use std::future::Future;

use pixelbatch_core::batch::GroupKey;
use pixelbatch_core::retry::RetryPolicy;

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts run out.
///
/// `op` must be safe to repeat: nothing with an outside effect (a webhook
/// send) may happen inside it.
pub(crate) async fn retry_transient<T, E, Fut>(
    policy: &RetryPolicy,
    key: &GroupKey,
    operation: &'static str,
    is_transient: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    group = %key,
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Storage operation failed, retrying",
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

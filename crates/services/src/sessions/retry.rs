use std::future::Future;

use tracing::debug;

use crate::config::RetryPolicy;
use crate::error::Transient;

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
pub(crate) async fn with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < policy.max_attempts() => {
                debug!(operation, attempt, error = %err, "retrying after transient failure");
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

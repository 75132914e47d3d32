use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::StorageError;

/// Bounded retry policy for storage I/O: capped exponential backoff with
/// uniform jitter. Shared by every component that talks to the storage
/// driver; persistent failure converts into an error for the caller to
/// record rather than blocking forever.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Run a storage operation, retrying transient errors up to the policy's
/// attempt limit. Permanent and not-found errors are returned immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut f: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut delay_ms = policy.base_delay_ms;
    let mut last_err = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
            delay_ms = (delay_ms * 2).min(policy.max_delay_ms);
        }
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                tracing::warn!(
                    "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    attempts,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap())
}

//! The optimistic commit retry loop (§4.E).
//!
//! ```text
//! 1. Read current version V.
//! 2. Prepare the commit body for version V+1.
//! 3. Write the commit file at the slot for V+1 with ifNoneMatch:"*".
//! 4. On success: commit observable, return {version: V+1}.
//! 5. On AlreadyExists: sleep base * 2^attempt with jitter; goto 1.
//!    After maxRetries, return Conflict.
//! 6. On Transient: retry without incrementing the conflict counter.
//! ```
//!
//! Suspension points are every blob-store call and every retry sleep (§5);
//! there are no hidden threads -- all parallelism is explicit in the I/O
//! layer, same as the teacher's async transaction commit.

use crate::blob::{BlobStore, WriteOptions};
use crate::cancel::CancellationToken;
use crate::commit::{CommitBatch, CommitDialect};
use crate::error::{DbResult, Error};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base: Duration,
    pub max_retries: u32,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            base: Duration::from_millis(50),
            max_retries: 8,
            jitter: true,
        }
    }
}

fn backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = config.base.saturating_mul(1u32 << attempt.min(20));
    if config.jitter {
        let factor: f64 = rand::rng().random_range(0.5..1.5);
        Duration::from_secs_f64(exp.as_secs_f64() * factor)
    } else {
        exp
    }
}

/// Drives `dialect` through the retry algorithm above and returns the
/// version that was durably committed.
pub async fn commit_with_retry(
    blob: &dyn BlobStore,
    dialect: &dyn CommitDialect,
    batch: CommitBatch,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> DbResult<u64> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let read_version = dialect.current_version().await?;
        let next_version = read_version.map(|v| v + 1).unwrap_or(0);
        let body = dialect.build_body(next_version, read_version, &batch).await?;
        let slot = dialect.slot_path(next_version);

        match blob.write(&slot, body, WriteOptions::if_none_match()).await {
            Ok(()) => {
                debug!(version = next_version, attempt, "commit succeeded");
                dialect.after_commit(next_version, &batch).await?;
                return Ok(next_version);
            }
            Err(Error::AlreadyExists(_)) => {
                attempt += 1;
                if attempt > config.max_retries {
                    return Err(Error::Conflict { attempts: attempt });
                }
                let wait = backoff(config, attempt);
                warn!(attempt, ?wait, "commit slot taken, retrying");
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                tokio::time::sleep(wait).await;
            }
            Err(e) if e.is_transient() => {
                // retry without incrementing the conflict counter (§4.E step 6)
                warn!(error = %e, "transient error committing, retrying");
                tokio::time::sleep(config.base).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct CountingDialect {
        slot_prefix: String,
        builds: Arc<AtomicU64>,
    }

    #[async_trait]
    impl CommitDialect for CountingDialect {
        async fn current_version(&self) -> DbResult<Option<u64>> {
            Ok(None)
        }

        fn slot_path(&self, next_version: u64) -> String {
            format!("{}{:020}.json", self.slot_prefix, next_version)
        }

        async fn build_body(
            &self,
            next_version: u64,
            _read_version: Option<u64>,
            _batch: &CommitBatch,
        ) -> DbResult<Bytes> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from(format!("{{\"version\":{next_version}}}")))
        }
    }

    #[tokio::test]
    async fn first_writer_wins_slot_zero() {
        let blob = MemoryBlobStore::new();
        let dialect = CountingDialect {
            slot_prefix: "t/".into(),
            builds: Arc::new(AtomicU64::new(0)),
        };
        let version = commit_with_retry(
            &blob,
            &dialect,
            CommitBatch::default(),
            &RetryConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn cancellation_before_write_aborts() {
        let blob = MemoryBlobStore::new();
        let dialect = CountingDialect {
            slot_prefix: "t/".into(),
            builds: Arc::new(AtomicU64::new(0)),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = commit_with_retry(&blob, &dialect, CommitBatch::default(), &RetryConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}

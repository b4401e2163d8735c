//! Adaptive range retriever.
//!
//! RPC providers cap both the block range and the result size of
//! `eth_getLogs`, and large queries tend to time out. The retriever hides
//! that from callers:
//! - limit / timeout on a range of two or more blocks → split at
//!   `ceil((start + end) / 2)` and fetch both halves concurrently
//! - any other failure (or a single block that still fails) → sleep and
//!   retry the same range, forever unless the policy caps attempts
//! - decode errors → surfaced immediately, retrying cannot fix them
//!
//! The returned window always carries the requested bounds, whatever the
//! split points were.

use crate::chain::ChainError;
use crate::deposit::types::DepositEventWindow;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[async_trait]
pub trait DepositEventSource: Send + Sync {
    async fn fetch_events(
        &self,
        start_block: u64,
        end_block: u64,
    ) -> Result<DepositEventWindow, ChainError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries until the provider recovers.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn bounded(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: Some(max_attempts),
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("blocks {start_block}..={end_block}: {source}")]
    Fatal {
        start_block: u64,
        end_block: u64,
        #[source]
        source: ChainError,
    },
    #[error("blocks {start_block}..={end_block}: gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        start_block: u64,
        end_block: u64,
        attempts: u32,
        last: ChainError,
    },
}

#[derive(Clone)]
pub struct RangeRetriever {
    source: Arc<dyn DepositEventSource>,
    policy: RetryPolicy,
}

impl RangeRetriever {
    pub fn new(source: Arc<dyn DepositEventSource>, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    /// Fetch every deposit in `[start_block, end_block]`.
    pub fn fetch_range(
        &self,
        start_block: u64,
        end_block: u64,
    ) -> BoxFuture<'_, Result<DepositEventWindow, FetchError>> {
        async move {
            let mut attempts: u32 = 0;

            loop {
                let err = match self.source.fetch_events(start_block, end_block).await {
                    Ok(window) => return Ok(window),
                    Err(e) => e,
                };

                if err.is_fatal() {
                    return Err(FetchError::Fatal {
                        start_block,
                        end_block,
                        source: err,
                    });
                }

                if err.is_partition_required() && end_block > start_block {
                    let center = start_block + (end_block - start_block + 1) / 2;
                    debug!(start_block, end_block, center, error = %err, "splitting range");

                    let (first, second) = tokio::try_join!(
                        self.fetch_range(start_block, center - 1),
                        self.fetch_range(center, end_block),
                    )?;

                    let mut events = first.events;
                    events.extend(second.events);
                    return Ok(DepositEventWindow::new(events, start_block, end_block));
                }

                attempts += 1;
                if let Some(max) = self.policy.max_attempts {
                    if attempts >= max {
                        return Err(FetchError::RetriesExhausted {
                            start_block,
                            end_block,
                            attempts,
                            last: err,
                        });
                    }
                }

                warn!(
                    start_block,
                    end_block,
                    attempt = attempts,
                    retry_in_ms = self.policy.delay.as_millis() as u64,
                    error = %err,
                    "fetch error, retrying"
                );
                tokio::time::sleep(self.policy.delay).await;
            }
        }
        .boxed()
    }
}

//! Fan-out of new block heights.
//!
//! One task owns the upstream block subscription and republishes every
//! height on a broadcast channel. The deposit cache cadence and the guardian
//! evaluation loop each hold their own receiver, so a slow consumer never
//! delays the other one.

use super::ChainClient;

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 256;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct BlockNotifier {
    tx: broadcast::Sender<u64>,
}

impl Default for BlockNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.tx.subscribe()
    }

    /// Publish a height to every subscriber. Returns the number of receivers.
    pub fn notify(&self, block_number: u64) -> usize {
        self.tx.send(block_number).unwrap_or(0)
    }

    /// Start forwarding upstream blocks in a background task. Returns immediately.
    /// The upstream subscription is re-established automatically when it ends.
    pub fn start(&self, chain: Arc<dyn ChainClient>) -> tokio::task::JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            notifier.run_forever(chain).await;
        })
    }

    async fn run_forever(&self, chain: Arc<dyn ChainClient>) {
        let mut consecutive_failures: u32 = 0;

        loop {
            match chain.block_stream().await {
                Ok(mut stream) => {
                    info!("subscribed to new blocks");
                    consecutive_failures = 0;

                    while let Some(block_number) = stream.next().await {
                        let receivers = self.notify(block_number);
                        debug!(block = block_number, receivers, "new block");
                    }

                    warn!("block stream ended, resubscribing");
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(error = %e, failures = consecutive_failures, "block subscription error");
                }
            }

            let secs = 2u64
                .pow(consecutive_failures.min(6))
                .min(MAX_BACKOFF.as_secs());
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
    }
}

/// Receive the next block height, skipping over notifications a lagging
/// consumer missed. Returns `None` once the notifier is gone.
pub async fn next_block(rx: &mut broadcast::Receiver<u64>, consumer: &str) -> Option<u64> {
    loop {
        match rx.recv().await {
            Ok(block_number) => return Some(block_number),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(consumer, skipped, "block consumer lagging, skipped notifications");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChain;

    #[tokio::test]
    async fn test_each_subscriber_sees_every_block() {
        let notifier = BlockNotifier::new();
        let mut deposits = notifier.subscribe();
        let mut guardian = notifier.subscribe();

        for n in 100..103 {
            assert_eq!(notifier.notify(n), 2);
        }

        for n in 100..103 {
            assert_eq!(next_block(&mut deposits, "deposits").await, Some(n));
            assert_eq!(next_block(&mut guardian, "guardian").await, Some(n));
        }
    }

    #[tokio::test]
    async fn test_lagging_consumer_continues_with_newest() {
        let notifier = BlockNotifier::new();
        let mut rx = notifier.subscribe();

        for n in 0..(CHANNEL_CAPACITY as u64 + 10) {
            notifier.notify(n);
        }

        let first = next_block(&mut rx, "test").await.unwrap();
        assert_eq!(first, 10);
    }

    #[tokio::test]
    async fn test_forwards_upstream_stream() {
        let chain = Arc::new(MockChain::new(1, 1_000));
        chain.set_block_stream(vec![1_001, 1_002]);

        let notifier = BlockNotifier::new();
        let mut rx = notifier.subscribe();
        let handle = notifier.start(chain);

        assert_eq!(next_block(&mut rx, "test").await, Some(1_001));
        assert_eq!(next_block(&mut rx, "test").await, Some(1_002));
        handle.abort();
    }
}

//! Deposit event service.
//!
//! Keeps a durable, contiguous window of every deposit since the contract's
//! deployment and answers "which pubkeys have already been deposited?".
//!
//! - historical blocks come from the on-disk cache, refreshed in
//!   `events_step` chunks up to `head - cache_lag_blocks`
//! - the most recent `fresh_blocks` are fetched live on every query, so
//!   deposits too close to the tip for the cache are still seen
//! - a gap between the two windows is an error, never silently skipped

use crate::chain::blocks::next_block;
use crate::chain::{BlockNotifier, ChainClient, ChainError};
use crate::config::DepositConfig;
use crate::deposit::cache::{CacheError, DepositCacheStore};
use crate::deposit::contract::{self, DepositContract};
use crate::deposit::retriever::{FetchError, RangeRetriever, RetryPolicy};
use crate::deposit::types::{DepositEventWindow, PubKey};

use alloy::primitives::B256;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum DepositError {
    #[error("events are not collected yet: cache ends at block {cached_end}, fresh window starts at {fresh_start}")]
    EventsNotCollected { cached_end: u64, fresh_start: u64 },
    #[error("deposit fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositSettings {
    /// Blocks per historical chunk.
    pub events_step: u64,
    /// Blocks behind the head fetched live on every query.
    pub fresh_blocks: u64,
    /// Refresh the cache on every block divisible by this.
    pub cache_update_block_rate: u64,
    /// Blocks behind the head never written to the cache.
    pub cache_lag_blocks: u64,
    pub retry: RetryPolicy,
    /// Overrides the built-in deployment block for the connected chain.
    pub deployment_block: Option<u64>,
}

impl From<&DepositConfig> for DepositSettings {
    fn from(config: &DepositConfig) -> Self {
        let delay = Duration::from_millis(config.retry_timeout_ms);
        Self {
            events_step: config.events_step,
            fresh_blocks: config.fresh_blocks,
            cache_update_block_rate: config.cache_update_block_rate,
            cache_lag_blocks: config.cache_lag_blocks,
            retry: match config.max_retries {
                Some(max) => RetryPolicy::bounded(delay, max),
                None => RetryPolicy::unbounded(delay),
            },
            deployment_block: config.deployment_block,
        }
    }
}

/// Result of one cache refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheUpdate {
    pub new_events: usize,
    pub total_events: usize,
}

pub struct DepositService {
    chain: Arc<dyn ChainClient>,
    contract: Arc<DepositContract>,
    retriever: RangeRetriever,
    store: DepositCacheStore,
    settings: DepositSettings,
    /// In-memory mirror of the store, loaded lazily and replaced on every write.
    cache: RwLock<Option<Arc<DepositEventWindow>>>,
    /// Held for the duration of a cache refresh; a second trigger is dropped.
    collecting: Mutex<()>,
}

impl DepositService {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        contract: Arc<DepositContract>,
        store: DepositCacheStore,
        settings: DepositSettings,
    ) -> Self {
        let retriever = RangeRetriever::new(contract.clone(), settings.retry);
        Self {
            chain,
            contract,
            retriever,
            store,
            settings,
            cache: RwLock::new(None),
            collecting: Mutex::new(()),
        }
    }

    pub async fn deployment_block(&self) -> Result<u64, DepositError> {
        match self.settings.deployment_block {
            Some(block) => Ok(block),
            None => Ok(contract::deployment_block(self.chain.chain_id().await?)),
        }
    }

    /// The cached window, with bounds raised to the deployment block so a
    /// stale or foreign cache cannot claim blocks before the contract existed.
    /// An empty cache ends one block before deployment.
    pub async fn get_cached_events(&self) -> Result<Arc<DepositEventWindow>, DepositError> {
        if let Some(window) = self.cache.read().await.as_ref() {
            return Ok(window.clone());
        }

        let mut slot = self.cache.write().await;
        if let Some(window) = slot.as_ref() {
            return Ok(window.clone());
        }

        let deployment_block = self.deployment_block().await?;
        let mut window = self.store.get().await;
        window.start_block = window.start_block.max(deployment_block);
        window.end_block = window.end_block.max(deployment_block.saturating_sub(1));

        info!(
            start_block = window.start_block,
            end_block = window.end_block,
            events = window.events.len(),
            "deposit cache loaded"
        );

        let window = Arc::new(window);
        *slot = Some(window.clone());
        Ok(window)
    }

    async fn set_cached_events(&self, window: DepositEventWindow) -> Result<(), DepositError> {
        self.store.set(&window).await?;
        *self.cache.write().await = Some(Arc::new(window));
        Ok(())
    }

    /// The last `fresh_blocks` blocks up to the current head.
    pub async fn get_fresh_events(&self) -> Result<DepositEventWindow, DepositError> {
        let end_block = self.chain.block_number().await?;
        let start_block = end_block.saturating_sub(self.settings.fresh_blocks);
        let window = self.retriever.fetch_range(start_block, end_block).await?;

        debug!(
            start_block,
            end_block,
            events = window.events.len(),
            "fresh events fetched"
        );
        Ok(window)
    }

    /// Every pubkey that has ever been deposited, cached history plus fresh blocks.
    pub async fn get_all_deposited_pub_keys(&self) -> Result<HashSet<PubKey>, DepositError> {
        let (cached, fresh) = tokio::try_join!(self.get_cached_events(), self.get_fresh_events())?;

        if cached.end_block < fresh.start_block {
            return Err(DepositError::EventsNotCollected {
                cached_end: cached.end_block,
                fresh_start: fresh.start_block,
            });
        }

        Ok(cached.pubkeys().chain(fresh.pubkeys()).copied().collect())
    }

    pub async fn get_deposit_root(&self) -> Result<B256, DepositError> {
        Ok(self.contract.deposit_root().await?)
    }

    /// Extend the cache up to `head - cache_lag_blocks`.
    ///
    /// Returns `None` when a refresh is already running or this one failed;
    /// the previously cached window stays valid in both cases.
    pub async fn cache_events(&self) -> Option<CacheUpdate> {
        let Ok(_guard) = self.collecting.try_lock() else {
            debug!("deposit cache refresh already running");
            return None;
        };

        match self.update_cache().await {
            Ok(update) => Some(update),
            Err(e) => {
                error!(error = %e, "deposit cache refresh failed");
                None
            }
        }
    }

    async fn update_cache(&self) -> Result<CacheUpdate, DepositError> {
        let started = Instant::now();

        let (current_block, initial) = tokio::try_join!(
            async { Ok::<_, DepositError>(self.chain.block_number().await?) },
            self.get_cached_events(),
        )?;

        let to_block = current_block.saturating_sub(self.settings.cache_lag_blocks);
        let step = self.settings.events_step.max(1);
        let mut window = (*initial).clone();
        let Some(mut chunk_start) = initial.end_block.checked_add(1) else {
            return Ok(CacheUpdate {
                new_events: 0,
                total_events: initial.events.len(),
            });
        };

        while chunk_start <= to_block {
            let chunk_end = to_block.min(chunk_start.saturating_add(step - 1));
            let chunk = self.retriever.fetch_range(chunk_start, chunk_end).await?;

            window.append(chunk);
            self.set_cached_events(window.clone()).await?;

            info!(
                start_block = chunk_start,
                end_block = chunk_end,
                events = window.events.len(),
                "historical events fetched"
            );
            chunk_start = chunk_end + 1;
        }

        let total_events = window.events.len();
        let new_events = total_events - initial.events.len();

        info!(
            new_events,
            total_events,
            end_block = window.end_block,
            fetch_time_ms = started.elapsed().as_millis() as u64,
            "deposit cache is updated"
        );

        Ok(CacheUpdate {
            new_events,
            total_events,
        })
    }

    /// Warm the cache once before anything reads it.
    pub async fn initialize(&self) -> Option<CacheUpdate> {
        self.cache_events().await
    }

    /// Refresh the cache in the background on every `cache_update_block_rate`-th
    /// block. Overlapping refreshes are absorbed by the reentrancy guard.
    pub fn start(self: &Arc<Self>, notifier: &BlockNotifier) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let mut blocks = notifier.subscribe();
        let rate = self.settings.cache_update_block_rate.max(1);

        tokio::spawn(async move {
            info!(rate, "deposit service subscribed to new blocks");
            while let Some(block_number) = next_block(&mut blocks, "deposit-cache").await {
                if block_number % rate != 0 {
                    continue;
                }
                let service = service.clone();
                tokio::spawn(async move {
                    service.cache_events().await;
                });
            }
        })
    }
}

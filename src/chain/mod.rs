//! Chain query capability.
//!
//! Everything the guardian needs from an Ethereum node sits behind the
//! `ChainClient` trait so the deposit engine and the guardian state machine
//! can be driven by a fake chain in tests:
//! - current block height and chain identity
//! - contract log queries by address / topic / block range
//! - read-only contract calls (deposit root, contract address lookups)
//! - a live stream of new block heights
//!
//! `provider::AlloyChainClient` is the production implementation and
//! `blocks::BlockNotifier` fans one upstream block stream out to every
//! consumer task.

pub mod blocks;
pub mod provider;

use alloy::primitives::{Address, Bytes, B256};
use alloy::rpc::types::Log;
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use blocks::BlockNotifier;
pub use provider::AlloyChainClient;

/// JSON-RPC error code providers use for "query returned more than N results"
/// and "block range too large".
pub const ERROR_LIMIT_EXCEEDED: i64 = -32005;

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    /// The provider refused the query because the range or result set is too large.
    #[error("provider limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("rpc request timed out")]
    Timeout,
    #[error("rpc error: {0}")]
    Rpc(String),
    /// Data returned by the node could not be decoded. Retrying the same
    /// query will not help.
    #[error("decode error: {0}")]
    Decode(String),
    #[error("block subscription failed: {0}")]
    Subscription(String),
}

impl ChainError {
    /// Errors that go away when the same query is split into smaller ranges.
    pub fn is_partition_required(&self) -> bool {
        matches!(self, ChainError::LimitExceeded(_) | ChainError::Timeout)
    }

    /// Errors that must be surfaced instead of retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::Decode(_))
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Logs emitted by `address` with the given topic0 in `[from, to]`, inclusive.
    async fn get_logs(
        &self,
        address: Address,
        topic0: B256,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, ChainError>;

    /// `eth_call` against the latest block.
    async fn call(
        &self,
        to: Address,
        from: Option<Address>,
        input: Bytes,
    ) -> Result<Bytes, ChainError>;

    /// New block heights in ascending order. Ends when the upstream connection drops.
    async fn block_stream(&self) -> Result<BoxStream<'static, u64>, ChainError>;
}

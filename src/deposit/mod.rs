//! Event collection engine for the beacon chain deposit contract.
//!
//! - `contract`: resolves the deposit contract through Lido, fetches and
//!   decodes `DepositEvent` logs, reads the deposit root
//! - `retriever`: splits ranges the provider refuses and retries transient failures
//! - `cache`: one JSON window per chain on disk
//! - `service`: incremental cache refresh plus the fresh window near the tip

pub mod abi;
pub mod cache;
pub mod contract;
pub mod retriever;
pub mod service;
pub mod types;

pub use cache::DepositCacheStore;
pub use contract::DepositContract;
pub use retriever::{RangeRetriever, RetryPolicy};
pub use service::{DepositError, DepositService, DepositSettings};
pub use types::{DepositEvent, DepositEventWindow, PubKey};

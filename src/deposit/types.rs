//! Deposit event records and the cached event window.

use alloy::primitives::{FixedBytes, B256};
use serde::{Deserialize, Serialize};

/// 48-byte BLS validator public key.
pub type PubKey = FixedBytes<48>;

/// 96-byte BLS signature.
pub type BlsSignature = FixedBytes<96>;

/// One decoded `DepositEvent` from the deposit contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositEvent {
    pub pubkey: PubKey,
    pub withdrawal_credentials: B256,
    /// Deposit amount in gwei.
    pub amount: u64,
    pub signature: BlsSignature,
    pub transaction_hash: B256,
    pub block_number: u64,
}

/// A contiguous, inclusive block range together with every deposit event
/// found in it, in ascending block order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositEventWindow {
    pub events: Vec<DepositEvent>,
    pub start_block: u64,
    pub end_block: u64,
}

impl DepositEventWindow {
    pub fn new(events: Vec<DepositEvent>, start_block: u64, end_block: u64) -> Self {
        Self {
            events,
            start_block,
            end_block,
        }
    }

    pub fn empty(start_block: u64, end_block: u64) -> Self {
        Self::new(Vec::new(), start_block, end_block)
    }

    /// Append the next adjacent window. Events keep their order and the
    /// window's end moves to the chunk's end.
    pub fn append(&mut self, chunk: DepositEventWindow) {
        self.end_block = chunk.end_block;
        self.events.extend(chunk.events);
    }

    pub fn pubkeys(&self) -> impl Iterator<Item = &PubKey> + '_ {
        self.events.iter().map(|event| &event.pubkey)
    }
}

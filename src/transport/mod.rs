//! Guardian message transport.
//!
//! All guardians watching a chain share one topic, `<prefix>-<chain id>`.
//! Attestations and alarms travel on the same topic and are told apart by
//! the `type` tag of the payload.

pub mod memory;
pub mod webhook;

use crate::deposit::types::PubKey;

use alloy::primitives::B256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryTransport;
pub use webhook::WebhookTransport;

pub const DEFAULT_TOPIC_PREFIX: &str = "defender";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GuardianMessage {
    /// Attestation that nothing deposited so far collides with the registry's next keys.
    #[serde(rename_all = "camelCase")]
    Deposit {
        deposit_root: B256,
        keys_op_index: u64,
        block_number: u64,
    },
    /// Alarm: some of the registry's next keys were already deposited by someone else.
    #[serde(rename_all = "camelCase")]
    Pause {
        deposit_root: B256,
        keys_op_index: u64,
        block_number: u64,
        already_deposited_pub_keys: Vec<PubKey>,
    },
}

impl std::fmt::Display for GuardianMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deposit {
                keys_op_index,
                block_number,
                ..
            } => write!(f, "Deposit(block={block_number}, keysOpIndex={keys_op_index})"),
            Self::Pause {
                block_number,
                already_deposited_pub_keys,
                ..
            } => write!(
                f,
                "Pause(block={block_number}, keys={})",
                already_deposited_pub_keys.len()
            ),
        }
    }
}

/// Topic shared by every guardian on `chain_id`.
pub fn message_topic(prefix: &str, chain_id: u64) -> String {
    format!("{prefix}-{chain_id}")
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport rejected message {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, message: &GuardianMessage) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<GuardianMessage>, TransportError>;
}

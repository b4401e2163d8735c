//! Node operators registry reads.
//!
//! The guardian needs two things from the registry: the batch of keys the
//! protocol will deposit next, and the keys operation index that increments
//! on every key change.

use crate::chain::{ChainClient, ChainError};
use crate::deposit::types::PubKey;

use alloy::primitives::{Address, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const PUBKEY_LENGTH: usize = 48;

alloy::sol! {
    interface INodeOperatorsRegistry {
        function getKeysOpIndex() external view returns (uint256);
        function assignNextSigningKeys(uint256 _numKeys)
            external
            returns (bytes memory pubkeys, bytes memory signatures);
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("malformed registry response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait KeysRegistry: Send + Sync {
    /// Keys the protocol is about to deposit, in registry order.
    async fn next_keys(&self) -> Result<Vec<PubKey>, RegistryError>;

    async fn keys_op_index(&self) -> Result<u64, RegistryError>;
}

pub struct ContractRegistry {
    chain: Arc<dyn ChainClient>,
    registry: Address,
    /// `assignNextSigningKeys` is only callable by Lido, so the static call is sent from it.
    lido: Address,
    max_deposit_keys: u64,
}

impl ContractRegistry {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        registry: Address,
        lido: Address,
        max_deposit_keys: u64,
    ) -> Self {
        Self {
            chain,
            registry,
            lido,
            max_deposit_keys,
        }
    }
}

#[async_trait]
impl KeysRegistry for ContractRegistry {
    async fn next_keys(&self) -> Result<Vec<PubKey>, RegistryError> {
        let input = INodeOperatorsRegistry::assignNextSigningKeysCall {
            _numKeys: U256::from(self.max_deposit_keys),
        }
        .abi_encode();
        let raw = self
            .chain
            .call(self.registry, Some(self.lido), input.into())
            .await?;
        let assigned = INodeOperatorsRegistry::assignNextSigningKeysCall::abi_decode_returns(&raw)
            .map_err(|e| RegistryError::Malformed(format!("assignNextSigningKeys: {e}")))?;

        let keys = split_pubkeys(&assigned.pubkeys)?;
        debug!(keys = keys.len(), "next registry keys");
        Ok(keys)
    }

    async fn keys_op_index(&self) -> Result<u64, RegistryError> {
        let input = INodeOperatorsRegistry::getKeysOpIndexCall {}.abi_encode();
        let raw = self.chain.call(self.registry, None, input.into()).await?;
        let index = INodeOperatorsRegistry::getKeysOpIndexCall::abi_decode_returns(&raw)
            .map_err(|e| RegistryError::Malformed(format!("getKeysOpIndex: {e}")))?;

        u64::try_from(index)
            .map_err(|_| RegistryError::Malformed(format!("keys op index {index} overflows u64")))
    }
}

/// Split concatenated 48-byte public keys.
pub fn split_pubkeys(packed: &[u8]) -> Result<Vec<PubKey>, RegistryError> {
    if packed.len() % PUBKEY_LENGTH != 0 {
        return Err(RegistryError::Malformed(format!(
            "packed pubkeys length {} is not a multiple of {PUBKEY_LENGTH}",
            packed.len()
        )));
    }
    Ok(packed
        .chunks_exact(PUBKEY_LENGTH)
        .map(PubKey::from_slice)
        .collect())
}

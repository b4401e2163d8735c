//! Deposit contract binding: address resolution, log fetching and decoding.

use crate::chain::{ChainClient, ChainError};
use crate::deposit::abi::{self, IDepositContract, ILido, DEPOSIT_EVENT_TOPIC};
use crate::deposit::retriever::DepositEventSource;
use crate::deposit::types::{BlsSignature, DepositEvent, DepositEventWindow, PubKey};

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Known deposit contract deployment blocks, by chain id.
pub fn deployment_block(chain_id: u64) -> u64 {
    match chain_id {
        1 => 11_052_984,
        5 => 4_367_322,
        17000 => 0,
        11155111 => 1_273_020,
        _ => 0,
    }
}

pub struct DepositContract {
    chain: Arc<dyn ChainClient>,
    lido: Address,
    /// Resolved once from Lido, then reused for the life of the process.
    address: OnceCell<Address>,
}

impl DepositContract {
    pub fn new(chain: Arc<dyn ChainClient>, lido: Address) -> Self {
        Self {
            chain,
            lido,
            address: OnceCell::new(),
        }
    }

    pub async fn address(&self) -> Result<Address, ChainError> {
        self.address
            .get_or_try_init(|| async {
                let input = ILido::getDepositContractCall {}.abi_encode();
                let raw = self.chain.call(self.lido, None, input.into()).await?;
                let address = ILido::getDepositContractCall::abi_decode_returns(&raw)
                    .map_err(|e| ChainError::Decode(format!("getDepositContract: {e}")))?;
                info!(lido = %self.lido, deposit_contract = %address, "resolved deposit contract");
                Ok(address)
            })
            .await
            .copied()
    }

    /// Current Merkle root of the deposit contract.
    pub async fn deposit_root(&self) -> Result<B256, ChainError> {
        let address = self.address().await?;
        let input = IDepositContract::get_deposit_rootCall {}.abi_encode();
        let raw = self.chain.call(address, None, input.into()).await?;
        IDepositContract::get_deposit_rootCall::abi_decode_returns(&raw)
            .map_err(|e| ChainError::Decode(format!("get_deposit_root: {e}")))
    }

    /// Fetch and decode every deposit in `[start_block, end_block]`.
    pub async fn fetch_events(
        &self,
        start_block: u64,
        end_block: u64,
    ) -> Result<DepositEventWindow, ChainError> {
        let address = self.address().await?;
        let logs = self
            .chain
            .get_logs(address, DEPOSIT_EVENT_TOPIC, start_block, end_block)
            .await?;

        let events = logs
            .iter()
            .map(decode_deposit_log)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(start_block, end_block, events = events.len(), "deposit logs fetched");
        Ok(DepositEventWindow::new(events, start_block, end_block))
    }
}

#[async_trait]
impl DepositEventSource for DepositContract {
    async fn fetch_events(
        &self,
        start_block: u64,
        end_block: u64,
    ) -> Result<DepositEventWindow, ChainError> {
        DepositContract::fetch_events(self, start_block, end_block).await
    }
}

/// Decode a raw `DepositEvent` log into a `DepositEvent` record.
pub fn decode_deposit_log(log: &Log) -> Result<DepositEvent, ChainError> {
    let block_number = log
        .block_number
        .ok_or_else(|| ChainError::Decode("log without block_number".into()))?;
    let transaction_hash = log
        .transaction_hash
        .ok_or_else(|| ChainError::Decode("log without transaction_hash".into()))?;

    let decoded = log
        .log_decode::<abi::DepositEvent>()
        .map_err(|e| ChainError::Decode(format!("DepositEvent at block {block_number}: {e}")))?;
    let event = decoded.inner.data;

    let pubkey = PubKey::try_from(event.pubkey.as_ref())
        .map_err(|_| field_length_error("pubkey", event.pubkey.len(), block_number))?;
    let withdrawal_credentials = B256::try_from(event.withdrawal_credentials.as_ref())
        .map_err(|_| {
            field_length_error(
                "withdrawal_credentials",
                event.withdrawal_credentials.len(),
                block_number,
            )
        })?;
    let signature = BlsSignature::try_from(event.signature.as_ref())
        .map_err(|_| field_length_error("signature", event.signature.len(), block_number))?;
    let amount_bytes: [u8; 8] = event
        .amount
        .as_ref()
        .try_into()
        .map_err(|_| field_length_error("amount", event.amount.len(), block_number))?;

    Ok(DepositEvent {
        pubkey,
        withdrawal_credentials,
        amount: u64::from_le_bytes(amount_bytes),
        signature,
        transaction_hash,
        block_number,
    })
}

fn field_length_error(field: &str, len: usize, block_number: u64) -> ChainError {
    ChainError::Decode(format!(
        "DepositEvent at block {block_number}: unexpected {field} length {len}"
    ))
}

//! Test fixtures: deterministic deposit records and an in-memory chain.

use crate::chain::{ChainClient, ChainError};
use crate::deposit::abi::{self, IDepositContract, ILido, DEPOSIT_EVENT_TOPIC};
use crate::deposit::types::{BlsSignature, DepositEvent, PubKey};
use crate::registry::INodeOperatorsRegistry;

use alloy::primitives::{address, Address, Bytes, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::{SolCall, SolEvent, SolValue};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Mutex;

pub const LIDO_ADDRESS: Address = address!("ae7ab96520DE3A18E5e111B5EaAb095312D7fE84");
pub const DEPOSIT_ADDRESS: Address = address!("00000000219ab540356cBB839Cbe05303d7705Fa");
pub const REGISTRY_ADDRESS: Address = address!("55032650b14df07b85bF18A3a3eC8E0Af2e028d5");

pub fn pubkey(seed: u8) -> PubKey {
    PubKey::repeat_byte(seed)
}

/// A 32 ETH deposit whose pubkey depends only on `seed`.
pub fn deposit_event(seed: u8, block_number: u64) -> DepositEvent {
    let mut tx = [0u8; 32];
    tx[0] = seed;
    tx[24..].copy_from_slice(&block_number.to_be_bytes());

    DepositEvent {
        pubkey: pubkey(seed),
        withdrawal_credentials: B256::repeat_byte(seed.wrapping_add(1)),
        amount: 32_000_000_000,
        signature: BlsSignature::repeat_byte(seed.wrapping_add(2)),
        transaction_hash: B256::from(tx),
        block_number,
    }
}

/// The raw log the deposit contract would emit for `event`.
pub fn deposit_log(event: &DepositEvent) -> Log {
    let data = abi::DepositEvent {
        pubkey: Bytes::copy_from_slice(event.pubkey.as_slice()),
        withdrawal_credentials: Bytes::copy_from_slice(event.withdrawal_credentials.as_slice()),
        amount: Bytes::copy_from_slice(&event.amount.to_le_bytes()),
        signature: Bytes::copy_from_slice(event.signature.as_slice()),
        index: Bytes::copy_from_slice(&0u64.to_le_bytes()),
    }
    .encode_log_data();

    Log {
        inner: alloy::primitives::Log {
            address: DEPOSIT_ADDRESS,
            data,
        },
        block_number: Some(event.block_number),
        transaction_hash: Some(event.transaction_hash),
        ..Default::default()
    }
}

#[derive(Default)]
struct MockState {
    head: u64,
    events: Vec<DepositEvent>,
    max_log_span: Option<u64>,
    fail_logs_from: Option<(u64, ChainError)>,
    log_queries: Vec<(u64, u64)>,
    deposit_root: B256,
    address_lookups: usize,
    next_keys: Vec<PubKey>,
    keys_op_index: u64,
    next_keys_caller: Option<Address>,
    block_stream: Vec<u64>,
}

/// In-memory chain with the Lido, deposit and registry contracts deployed
/// at the fixture addresses.
pub struct MockChain {
    chain_id: u64,
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(chain_id: u64, head: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(MockState {
                head,
                ..Default::default()
            }),
        }
    }

    pub fn add_events(&self, events: Vec<DepositEvent>) {
        self.state.lock().unwrap().events.extend(events);
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    /// Log queries spanning more than `span` blocks fail with LimitExceeded.
    pub fn set_max_log_span(&self, span: u64) {
        self.state.lock().unwrap().max_log_span = Some(span);
    }

    /// Log queries reaching `block` or later fail with `error`.
    pub fn fail_logs_from(&self, block: u64, error: ChainError) {
        self.state.lock().unwrap().fail_logs_from = Some((block, error));
    }

    /// Successful log queries, in the order they completed.
    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().log_queries.clone()
    }

    pub fn set_deposit_root(&self, root: B256) {
        self.state.lock().unwrap().deposit_root = root;
    }

    pub fn set_registry(&self, next_keys: Vec<PubKey>, keys_op_index: u64) {
        let mut state = self.state.lock().unwrap();
        state.next_keys = next_keys;
        state.keys_op_index = keys_op_index;
    }

    /// `from` of the last `assignNextSigningKeys` call.
    pub fn next_keys_caller(&self) -> Option<Address> {
        self.state.lock().unwrap().next_keys_caller
    }

    pub fn address_lookups(&self) -> usize {
        self.state.lock().unwrap().address_lookups
    }

    /// Heights yielded by the next `block_stream` call.
    pub fn set_block_stream(&self, blocks: Vec<u64>) {
        self.state.lock().unwrap().block_stream = blocks;
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn get_logs(
        &self,
        address: Address,
        topic0: B256,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, ChainError> {
        let mut state = self.state.lock().unwrap();

        if let Some(span) = state.max_log_span {
            if to.saturating_sub(from) + 1 > span {
                return Err(ChainError::LimitExceeded(format!(
                    "query returned more than {span} results"
                )));
            }
        }
        if let Some((block, error)) = &state.fail_logs_from {
            if to >= *block {
                return Err(error.clone());
            }
        }

        state.log_queries.push((from, to));
        if address != DEPOSIT_ADDRESS || topic0 != DEPOSIT_EVENT_TOPIC {
            return Ok(Vec::new());
        }
        Ok(state
            .events
            .iter()
            .filter(|e| (from..=to).contains(&e.block_number))
            .map(deposit_log)
            .collect())
    }

    async fn call(
        &self,
        to: Address,
        from: Option<Address>,
        input: Bytes,
    ) -> Result<Bytes, ChainError> {
        let mut state = self.state.lock().unwrap();
        let selector: [u8; 4] = input
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| ChainError::Rpc("call without selector".into()))?;

        let output = if to == LIDO_ADDRESS && selector == ILido::getDepositContractCall::SELECTOR {
            state.address_lookups += 1;
            DEPOSIT_ADDRESS.abi_encode()
        } else if to == DEPOSIT_ADDRESS
            && selector == IDepositContract::get_deposit_rootCall::SELECTOR
        {
            state.deposit_root.abi_encode()
        } else if to == REGISTRY_ADDRESS
            && selector == INodeOperatorsRegistry::getKeysOpIndexCall::SELECTOR
        {
            U256::from(state.keys_op_index).abi_encode()
        } else if to == REGISTRY_ADDRESS
            && selector == INodeOperatorsRegistry::assignNextSigningKeysCall::SELECTOR
        {
            state.next_keys_caller = from;
            let packed: Vec<u8> = state
                .next_keys
                .iter()
                .flat_map(|k| k.as_slice().to_vec())
                .collect();
            let signatures = vec![0u8; state.next_keys.len() * 96];
            (Bytes::from(packed), Bytes::from(signatures)).abi_encode_params()
        } else {
            return Err(ChainError::Rpc(format!("execution reverted: {to}")));
        };
        Ok(output.into())
    }

    async fn block_stream(&self) -> Result<BoxStream<'static, u64>, ChainError> {
        let blocks = std::mem::take(&mut self.state.lock().unwrap().block_stream);
        Ok(stream::iter(blocks).boxed())
    }
}

/// Poll `check` until it holds, giving up after two seconds.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    check()
}

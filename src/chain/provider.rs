//! `ChainClient` backed by an alloy provider.
//!
//! WebSocket URLs get a real `newHeads` subscription; HTTP URLs get a block
//! stream synthesised by polling `eth_blockNumber`. Every request carries a
//! deadline so a hung node surfaces as `ChainError::Timeout` instead of
//! stalling the caller forever.

use super::{ChainClient, ChainError, ERROR_LIMIT_EXCEEDED};

use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use alloy::transports::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::future::IntoFuture;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Provider messages that mean "make the query smaller".
const LIMIT_HINTS: &[&str] = &[
    "query returned more than",
    "block range",
    "range too large",
    "too many results",
    "response size exceeded",
    "limit exceeded",
];

pub struct AlloyChainClient {
    provider: DynProvider,
    is_ws: bool,
    request_timeout: Duration,
    poll_interval: Duration,
    chain_id: OnceCell<u64>,
}

impl AlloyChainClient {
    pub async fn connect(
        url: &str,
        request_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, ChainError> {
        let is_ws = url.starts_with("ws://") || url.starts_with("wss://");
        let provider = if is_ws {
            ProviderBuilder::new()
                .connect_ws(WsConnect::new(url))
                .await
                .map_err(classify)?
                .erased()
        } else {
            let rpc_url: reqwest::Url = url
                .parse()
                .map_err(|e| ChainError::Rpc(format!("invalid rpc url {url}: {e}")))?;
            ProviderBuilder::new().connect_http(rpc_url).erased()
        };

        info!(ws = is_ws, "connected to execution node");

        Ok(Self {
            provider,
            is_ws,
            request_timeout,
            poll_interval,
            chain_id: OnceCell::new(),
        })
    }

    async fn with_timeout<T, F>(&self, request: F) -> Result<T, ChainError>
    where
        F: IntoFuture<Output = Result<T, TransportError>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(ChainError::Timeout),
        }
    }

    fn poll_block_stream(&self) -> BoxStream<'static, u64> {
        struct PollState {
            provider: DynProvider,
            next: Option<u64>,
            head: u64,
        }

        let interval = self.poll_interval;
        let request_timeout = self.request_timeout;
        let initial = PollState {
            provider: self.provider.clone(),
            next: None,
            head: 0,
        };

        futures::stream::unfold(initial, move |mut state| async move {
            loop {
                if let Some(next) = state.next {
                    if next <= state.head {
                        state.next = Some(next + 1);
                        return Some((next, state));
                    }
                }

                tokio::time::sleep(interval).await;
                match tokio::time::timeout(request_timeout, state.provider.get_block_number())
                    .await
                {
                    Ok(Ok(head)) => {
                        if state.next.is_none() {
                            state.next = Some(head);
                        }
                        state.head = state.head.max(head);
                    }
                    Ok(Err(e)) => warn!(error = %e, "block poll failed"),
                    Err(_) => warn!("block poll timed out"),
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.chain_id
            .get_or_try_init(|| async { self.with_timeout(self.provider.get_chain_id()).await })
            .await
            .copied()
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.with_timeout(self.provider.get_block_number()).await
    }

    async fn get_logs(
        &self,
        address: Address,
        topic0: B256,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, ChainError> {
        let filter = Filter::new()
            .address(address)
            .event_signature(topic0)
            .from_block(from)
            .to_block(to);
        debug!(from, to, "eth_getLogs");
        self.with_timeout(self.provider.get_logs(&filter)).await
    }

    async fn call(
        &self,
        to: Address,
        from: Option<Address>,
        input: Bytes,
    ) -> Result<Bytes, ChainError> {
        let mut request = TransactionRequest::default().to(to).input(input.into());
        if let Some(from) = from {
            request = request.from(from);
        }
        self.with_timeout(self.provider.call(request)).await
    }

    async fn block_stream(&self) -> Result<BoxStream<'static, u64>, ChainError> {
        if !self.is_ws {
            return Ok(self.poll_block_stream());
        }

        let subscription = self
            .provider
            .subscribe_blocks()
            .await
            .map_err(|e| ChainError::Subscription(e.to_string()))?;
        Ok(subscription
            .into_stream()
            .map(|header| header.number)
            .boxed())
    }
}

/// Map a transport error onto the retry classes the range retriever understands.
pub(crate) fn classify(err: TransportError) -> ChainError {
    if let Some(payload) = err.as_error_resp() {
        let message = payload.message.to_lowercase();
        if payload.code == ERROR_LIMIT_EXCEEDED || LIMIT_HINTS.iter().any(|h| message.contains(h))
        {
            return ChainError::LimitExceeded(payload.message.to_string());
        }
        return ChainError::Rpc(format!("{} (code {})", payload.message, payload.code));
    }

    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        ChainError::Timeout
    } else {
        ChainError::Rpc(message)
    }
}

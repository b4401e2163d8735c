//! Guardian state machine.
//!
//! On every new block the guardian reads, concurrently:
//! 1. the registry's next keys and keys operation index
//! 2. every pubkey ever deposited and the current deposit root
//!
//! If `(keysOpIndex, depositRoot)` is the same as the last evaluation nothing
//! can have changed and the block is skipped. Otherwise the next keys are
//! intersected with the deposited set:
//! - empty intersection → broadcast a `deposit` attestation of the safe state
//! - any overlap → someone front-ran the registry; pause the protocol and
//!   broadcast a `pause` alarm, both attempted even if one fails
//!
//! Evaluations are serialised by the observed-state lock, so state updates
//! follow block order.

pub mod pause;

use crate::chain::blocks::next_block;
use crate::chain::BlockNotifier;
use crate::deposit::service::{DepositError, DepositService};
use crate::deposit::types::PubKey;
use crate::registry::{KeysRegistry, RegistryError};
use crate::transport::{GuardianMessage, Transport, TransportError};

use alloy::primitives::B256;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub use pause::{CommandPauser, DryRunPauser, PauseError, ProtocolPauser};

/// What the guardian needs from the deposit side.
#[async_trait]
pub trait DepositState: Send + Sync {
    async fn deposited_pub_keys(&self) -> Result<HashSet<PubKey>, DepositError>;
    async fn deposit_root(&self) -> Result<B256, DepositError>;
}

#[async_trait]
impl DepositState for DepositService {
    async fn deposited_pub_keys(&self) -> Result<HashSet<PubKey>, DepositError> {
        self.get_all_deposited_pub_keys().await
    }

    async fn deposit_root(&self) -> Result<B256, DepositError> {
        self.get_deposit_root().await
    }
}

/// The last state the guardian evaluated. Lives in memory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedState {
    pub keys_op_index: u64,
    pub deposit_root: B256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Same state as the previous evaluation, nothing sent.
    Unchanged,
    /// Safe state attested on the transport.
    Safe,
    /// These next keys were already deposited; pause requested and alarm sent.
    Suspicious(Vec<PubKey>),
}

#[derive(Error, Debug)]
pub enum GuardianError {
    #[error("registry read failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("deposit read failed: {0}")]
    Deposit(#[from] DepositError),
    #[error("broadcast failed: {0}")]
    Broadcast(#[from] TransportError),
    #[error("suspicious case handling failed (pause: {pause:?}, broadcast: {broadcast:?})")]
    Suspicious {
        pause: Option<PauseError>,
        broadcast: Option<TransportError>,
    },
}

pub struct Guardian {
    deposits: Arc<dyn DepositState>,
    registry: Arc<dyn KeysRegistry>,
    transport: Arc<dyn Transport>,
    pauser: Arc<dyn ProtocolPauser>,
    topic: String,
    state: Mutex<Option<ObservedState>>,
}

impl Guardian {
    pub fn new(
        deposits: Arc<dyn DepositState>,
        registry: Arc<dyn KeysRegistry>,
        transport: Arc<dyn Transport>,
        pauser: Arc<dyn ProtocolPauser>,
        topic: String,
    ) -> Self {
        Self {
            deposits,
            registry,
            transport,
            pauser,
            topic,
            state: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn observed_state(&self) -> Option<ObservedState> {
        *self.state.lock().await
    }

    /// Run one evaluation for `block_number`.
    pub async fn check_keys(&self, block_number: u64) -> Result<CheckOutcome, GuardianError> {
        let mut state = self.state.lock().await;

        let (next_keys, keys_op_index, deposited, deposit_root) = tokio::try_join!(
            async { Ok::<_, GuardianError>(self.registry.next_keys().await?) },
            async { Ok::<_, GuardianError>(self.registry.keys_op_index().await?) },
            async { Ok::<_, GuardianError>(self.deposits.deposited_pub_keys().await?) },
            async { Ok::<_, GuardianError>(self.deposits.deposit_root().await?) },
        )?;

        let current = ObservedState {
            keys_op_index,
            deposit_root,
        };
        let previous = state.replace(current);
        if previous == Some(current) {
            debug!(block = block_number, keys_op_index, "state unchanged");
            return Ok(CheckOutcome::Unchanged);
        }

        let already_deposited = match_pub_keys(&next_keys, &deposited);
        let result = if already_deposited.is_empty() {
            self.handle_correct_case(block_number, current)
                .await
                .map(|_| CheckOutcome::Safe)
        } else {
            self.handle_suspicious_case(block_number, current, &already_deposited)
                .await
                .map(|_| CheckOutcome::Suspicious(already_deposited))
        };

        // A failed side effect must not turn the next block into a no-op.
        if result.is_err() {
            *state = None;
        }
        result
    }

    async fn handle_correct_case(
        &self,
        block_number: u64,
        state: ObservedState,
    ) -> Result<(), GuardianError> {
        let message = GuardianMessage::Deposit {
            deposit_root: state.deposit_root,
            keys_op_index: state.keys_op_index,
            block_number,
        };
        debug!(block = block_number, %message, "correct case");

        self.transport.publish(&self.topic, &message).await?;
        Ok(())
    }

    async fn handle_suspicious_case(
        &self,
        block_number: u64,
        state: ObservedState,
        already_deposited: &[PubKey],
    ) -> Result<(), GuardianError> {
        warn!(
            block = block_number,
            keys_op_index = state.keys_op_index,
            deposit_root = %state.deposit_root,
            keys = ?already_deposited,
            "SUSPICIOUS CASE: next registry keys already deposited"
        );

        let message = GuardianMessage::Pause {
            deposit_root: state.deposit_root,
            keys_op_index: state.keys_op_index,
            block_number,
            already_deposited_pub_keys: already_deposited.to_vec(),
        };

        let (pause, broadcast) = tokio::join!(
            self.pauser.pause(),
            self.transport.publish(&self.topic, &message),
        );

        if pause.is_ok() && broadcast.is_ok() {
            return Ok(());
        }
        Err(GuardianError::Suspicious {
            pause: pause.err(),
            broadcast: broadcast.err(),
        })
    }

    /// Log every message other guardians publish on our topic.
    pub async fn subscribe_to_transport(&self) -> Option<tokio::task::JoinHandle<()>> {
        let mut rx = match self.transport.subscribe(&self.topic).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "not subscribed to transport");
                return None;
            }
        };

        info!(topic = %self.topic, "guardian subscribed to transport");
        Some(tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                debug!(%message, "transport message");
            }
        }))
    }

    /// Evaluate every new block, one at a time. Errors are logged and the
    /// next block evaluates again.
    pub fn start(self: &Arc<Self>, notifier: &BlockNotifier) -> tokio::task::JoinHandle<()> {
        let guardian = Arc::clone(self);
        let mut blocks = notifier.subscribe();

        tokio::spawn(async move {
            info!("guardian subscribed to new blocks");
            while let Some(block_number) = next_block(&mut blocks, "guardian").await {
                match guardian.check_keys(block_number).await {
                    Ok(CheckOutcome::Unchanged) => {}
                    Ok(CheckOutcome::Safe) => {
                        debug!(block = block_number, "deposit state attested")
                    }
                    Ok(CheckOutcome::Suspicious(keys)) => {
                        error!(block = block_number, keys = keys.len(), "protocol pause requested")
                    }
                    Err(e) => error!(block = block_number, error = %e, "guardian evaluation failed"),
                }
            }
        })
    }
}

/// Next keys that are already in the deposited set, in registry order.
pub fn match_pub_keys(next_keys: &[PubKey], deposited: &HashSet<PubKey>) -> Vec<PubKey> {
    next_keys
        .iter()
        .filter(|key| deposited.contains(*key))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pubkey;
    use crate::transport::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeDeposits {
        keys: std::sync::Mutex<HashSet<PubKey>>,
        root: std::sync::Mutex<B256>,
    }

    #[async_trait]
    impl DepositState for FakeDeposits {
        async fn deposited_pub_keys(&self) -> Result<HashSet<PubKey>, DepositError> {
            Ok(self.keys.lock().unwrap().clone())
        }

        async fn deposit_root(&self) -> Result<B256, DepositError> {
            Ok(*self.root.lock().unwrap())
        }
    }

    #[derive(Default)]
    struct FakeRegistry {
        keys: std::sync::Mutex<Vec<PubKey>>,
        op_index: std::sync::Mutex<u64>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl KeysRegistry for FakeRegistry {
        async fn next_keys(&self) -> Result<Vec<PubKey>, RegistryError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RegistryError::Malformed("node unavailable".into()));
            }
            Ok(self.keys.lock().unwrap().clone())
        }

        async fn keys_op_index(&self) -> Result<u64, RegistryError> {
            Ok(*self.op_index.lock().unwrap())
        }
    }

    #[derive(Default)]
    struct RecordingPauser {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ProtocolPauser for RecordingPauser {
        async fn pause(&self) -> Result<(), PauseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PauseError::EmptyCommand);
            }
            Ok(())
        }
    }

    struct Harness {
        guardian: Arc<Guardian>,
        transport: Arc<MemoryTransport>,
        deposits: Arc<FakeDeposits>,
        registry: Arc<FakeRegistry>,
        pauser: Arc<RecordingPauser>,
        messages: mpsc::UnboundedReceiver<GuardianMessage>,
    }

    impl Harness {
        async fn new(pauser: RecordingPauser) -> Self {
            let deposits = Arc::new(FakeDeposits::default());
            let registry = Arc::new(FakeRegistry::default());
            let pauser = Arc::new(pauser);
            let transport = Arc::new(MemoryTransport::new());
            let messages = transport.subscribe("defender-1").await.unwrap();
            let guardian = Arc::new(Guardian::new(
                deposits.clone(),
                registry.clone(),
                transport.clone(),
                pauser.clone(),
                "defender-1".to_string(),
            ));
            Self {
                guardian,
                transport,
                deposits,
                registry,
                pauser,
                messages,
            }
        }

        fn set_state(&self, next_keys: Vec<PubKey>, op_index: u64, deposited: &[PubKey], root: u8) {
            *self.registry.keys.lock().unwrap() = next_keys;
            *self.registry.op_index.lock().unwrap() = op_index;
            *self.deposits.keys.lock().unwrap() = deposited.iter().copied().collect();
            *self.deposits.root.lock().unwrap() = B256::repeat_byte(root);
        }

        fn drain(&mut self) -> Vec<GuardianMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.messages.try_recv() {
                out.push(message);
            }
            out
        }

        fn pause_calls(&self) -> usize {
            self.pauser.calls.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_first_evaluation_always_runs() {
        let mut h = Harness::new(RecordingPauser::default()).await;
        h.set_state(vec![pubkey(1)], 0, &[], 0);

        assert_eq!(h.guardian.check_keys(100).await.unwrap(), CheckOutcome::Safe);
        assert_eq!(
            h.drain(),
            vec![GuardianMessage::Deposit {
                deposit_root: B256::ZERO,
                keys_op_index: 0,
                block_number: 100,
            }]
        );
    }

    #[tokio::test]
    async fn test_unchanged_state_is_skipped() {
        let mut h = Harness::new(RecordingPauser::default()).await;
        h.set_state(vec![pubkey(1)], 7, &[pubkey(9)], 0xaa);

        assert_eq!(h.guardian.check_keys(100).await.unwrap(), CheckOutcome::Safe);
        assert_eq!(h.guardian.check_keys(101).await.unwrap(), CheckOutcome::Unchanged);
        assert_eq!(h.drain().len(), 1);

        h.set_state(vec![pubkey(1)], 7, &[pubkey(9)], 0xbb);
        assert_eq!(h.guardian.check_keys(102).await.unwrap(), CheckOutcome::Safe);

        h.set_state(vec![pubkey(1)], 8, &[pubkey(9)], 0xbb);
        assert_eq!(h.guardian.check_keys(103).await.unwrap(), CheckOutcome::Safe);
        assert_eq!(h.drain().len(), 2);
        assert_eq!(
            h.guardian.observed_state().await,
            Some(ObservedState {
                keys_op_index: 8,
                deposit_root: B256::repeat_byte(0xbb),
            })
        );
    }

    #[tokio::test]
    async fn test_front_run_key_pauses_and_alarms() {
        let mut h = Harness::new(RecordingPauser::default()).await;
        let (a, b, c) = (pubkey(1), pubkey(2), pubkey(3));
        h.set_state(vec![a, b, c], 5, &[b], 0x01);

        let outcome = h.guardian.check_keys(200).await.unwrap();

        assert_eq!(outcome, CheckOutcome::Suspicious(vec![b]));
        assert_eq!(h.pause_calls(), 1);
        assert_eq!(
            h.drain(),
            vec![GuardianMessage::Pause {
                deposit_root: B256::repeat_byte(0x01),
                keys_op_index: 5,
                block_number: 200,
                already_deposited_pub_keys: vec![b],
            }]
        );
    }

    #[tokio::test]
    async fn test_disjoint_or_empty_deposits_are_safe() {
        let mut h = Harness::new(RecordingPauser::default()).await;
        let next = vec![pubkey(1), pubkey(2), pubkey(3)];

        h.set_state(next.clone(), 5, &[], 0x01);
        assert_eq!(h.guardian.check_keys(200).await.unwrap(), CheckOutcome::Safe);

        h.set_state(next, 6, &[pubkey(4)], 0x01);
        assert_eq!(h.guardian.check_keys(201).await.unwrap(), CheckOutcome::Safe);

        assert_eq!(h.pause_calls(), 0);
        let messages = h.drain();
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[1],
            GuardianMessage::Deposit {
                deposit_root: B256::repeat_byte(0x01),
                keys_op_index: 6,
                block_number: 201,
            }
        );
    }

    #[tokio::test]
    async fn test_failed_pause_still_broadcasts_and_retries_next_block() {
        let mut h = Harness::new(RecordingPauser {
            fail: true,
            ..Default::default()
        })
        .await;
        h.set_state(vec![pubkey(1)], 5, &[pubkey(1)], 0x01);

        let err = h.guardian.check_keys(300).await.unwrap_err();
        assert!(matches!(
            err,
            GuardianError::Suspicious { pause: Some(_), broadcast: None }
        ));
        assert_eq!(h.drain().len(), 1);
        assert_eq!(h.guardian.observed_state().await, None);

        let err = h.guardian.check_keys(301).await.unwrap_err();
        assert!(matches!(err, GuardianError::Suspicious { .. }));
        assert_eq!(h.pause_calls(), 2);
    }

    #[tokio::test]
    async fn test_read_failure_leaves_state_untouched() {
        let h = Harness::new(RecordingPauser::default()).await;
        h.set_state(vec![pubkey(1)], 5, &[], 0x01);
        h.guardian.check_keys(400).await.unwrap();

        h.registry.fail.store(true, Ordering::SeqCst);
        h.set_state(vec![pubkey(1)], 6, &[], 0x02);
        let err = h.guardian.check_keys(401).await.unwrap_err();

        assert!(matches!(err, GuardianError::Registry(_)));
        assert_eq!(
            h.guardian.observed_state().await.map(|s| s.keys_op_index),
            Some(5)
        );
    }

    #[tokio::test]
    async fn test_block_loop_evaluates_each_notification() {
        let mut h = Harness::new(RecordingPauser::default()).await;
        h.set_state(vec![pubkey(1)], 1, &[], 0x01);
        let notifier = BlockNotifier::new();
        let handle = h.guardian.start(&notifier);

        notifier.notify(100);
        let first = tokio::time::timeout(Duration::from_secs(2), h.messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first,
            GuardianMessage::Deposit {
                deposit_root: B256::repeat_byte(0x01),
                keys_op_index: 1,
                block_number: 100,
            }
        );

        notifier.notify(101);
        h.set_state(vec![pubkey(1)], 2, &[], 0x01);
        notifier.notify(102);
        let second = tokio::time::timeout(Duration::from_secs(2), h.messages.recv())
            .await
            .unwrap()
            .unwrap();
        handle.abort();

        // 101 may see either state; 102 always sees the new one.
        match second {
            GuardianMessage::Deposit { block_number, keys_op_index, .. } => {
                assert!(block_number == 101 || block_number == 102);
                assert_eq!(keys_op_index, 2);
            }
            other => panic!("unexpected message: {other}"),
        }
        assert!(h.drain().len() <= 1);
    }

    #[tokio::test]
    async fn test_subscribes_to_own_topic() {
        let h = Harness::new(RecordingPauser::default()).await;
        assert_eq!(h.transport.subscriber_count("defender-1"), 1);

        let handle = h.guardian.subscribe_to_transport().await.unwrap();
        assert_eq!(h.transport.subscriber_count("defender-1"), 2);
        assert_eq!(h.transport.subscriber_count("defender-5"), 0);

        h.transport
            .publish(
                "defender-1",
                &GuardianMessage::Deposit {
                    deposit_root: B256::ZERO,
                    keys_op_index: 0,
                    block_number: 1,
                },
            )
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn test_publish_only_transport_is_not_subscribed() {
        struct PublishOnly;

        #[async_trait]
        impl Transport for PublishOnly {
            async fn publish(&self, _: &str, _: &GuardianMessage) -> Result<(), TransportError> {
                Ok(())
            }

            async fn subscribe(
                &self,
                _: &str,
            ) -> Result<mpsc::UnboundedReceiver<GuardianMessage>, TransportError> {
                Err(TransportError::Unsupported("subscribe"))
            }
        }

        let guardian = Guardian::new(
            Arc::new(FakeDeposits::default()),
            Arc::new(FakeRegistry::default()),
            Arc::new(PublishOnly),
            Arc::new(DryRunPauser),
            "defender-1".to_string(),
        );

        assert!(guardian.subscribe_to_transport().await.is_none());
    }

    #[test]
    fn test_match_keeps_registry_order() {
        let deposited: HashSet<PubKey> = [pubkey(3), pubkey(1)].into_iter().collect();
        let matched = match_pub_keys(&[pubkey(1), pubkey(2), pubkey(3)], &deposited);
        assert_eq!(matched, vec![pubkey(1), pubkey(3)]);
    }
}

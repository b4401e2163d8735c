//! Deposit contract ABI definitions and the pinned event topic.
//!
//! Only the pieces the guardian reads: the `DepositEvent` log, the deposit
//! root getter, and Lido's pointer to the deposit contract.

use alloy::primitives::{b256, B256};
use alloy::sol_types::SolEvent;

/// keccak256("DepositEvent(bytes,bytes,bytes,bytes,bytes)")
pub const DEPOSIT_EVENT_TOPIC: B256 =
    b256!("649bbc62d0e31342afea4e5cd82d4049e7e1ee912fc0889aa790803be39038c5");

alloy::sol! {
    /// Emitted by the beacon chain deposit contract for every deposit.
    /// `amount` and `index` are little-endian uint64 packed into bytes.
    event DepositEvent(
        bytes pubkey,
        bytes withdrawal_credentials,
        bytes amount,
        bytes signature,
        bytes index
    );

    interface IDepositContract {
        function get_deposit_root() external view returns (bytes32);
    }

    interface ILido {
        function getDepositContract() external view returns (address);
    }
}

/// Pinned topics whose value disagrees with the `sol!`-derived event hash.
/// Empty when every binding matches what the node will emit.
pub fn topic_mismatches() -> Vec<&'static str> {
    [(DepositEvent::SIGNATURE, DepositEvent::SIGNATURE_HASH, DEPOSIT_EVENT_TOPIC)]
        .into_iter()
        .filter(|(_, derived, pinned)| derived != pinned)
        .map(|(signature, _, _)| signature)
        .collect()
}

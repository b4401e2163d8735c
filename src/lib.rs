//! Deposit guardian for the Lido staking protocol.
//!
//! Watches the beacon chain deposit contract and the node operators
//! registry. When a key the protocol is about to deposit has already been
//! deposited by someone else, the guardian pauses the protocol and alerts
//! the other guardians.

pub mod chain;
pub mod config;
pub mod deposit;
pub mod guardian;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

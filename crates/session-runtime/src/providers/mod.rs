//! Broker implementations.
//!
//! This module contains concrete implementations of the [`Broker`](crate::broker::Broker)
//! trait.

pub mod memory;

pub use memory::{
    DeadLetteredMessage, InMemoryBroker, InMemoryBrokerConfig, SettlementRecord,
};

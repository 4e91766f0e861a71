//! Tabsync: Cross-Context State Synchronization Engine
//!
//! Keeps per-tab floating mini-windows consistent across isolated execution
//! contexts over unreliable messaging and an eventually-consistent shared
//! store, with strict per-context ownership and optimistic persistence.

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod events;
pub mod identity;
pub mod lifecycle;
pub mod logging;
pub mod persist;
pub mod runtime;
pub mod sharedstore;
pub mod snapshot;
pub mod types;

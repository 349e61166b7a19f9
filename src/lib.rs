//! resell_ledger - multi-tenant ledger and settlement engine
//!
//! Shop owners resell marketplace orders that fulfilment operators ship;
//! every completed order is split three ways between the platform, the
//! operator and the shop owner.
//!
//! # Modules
//!
//! - [`shard`] - principal id to journal partition
//! - [`account`] - balance rows, journal entries, the transaction poster
//! - [`lock`] / [`coord`] - leases over the shared coordination store
//! - [`directory`] / [`shop`] / [`shipment`] - tenants, shops, shipments
//! - [`sync`] / [`upstream`] - per-shop order, income and escrow sync
//! - [`settlement`] - three-way profit split and its posting
//! - [`funding`] - withdraw and recharge audit workflows
//! - [`webhook`] - marketplace push ingress and dispatch
//! - [`store`] / [`db`] - persistence (PostgreSQL or in-memory)
//! - [`gateway`] - HTTP adapter

// Core types - must be first!
pub mod core_types;
pub mod error;
pub mod money;
pub mod shard;

pub mod config;
pub mod logging;

pub mod coord;
pub mod db;
pub mod idgen;
pub mod lock;
pub mod store;

pub mod account;
pub mod directory;
pub mod models;
pub mod shipment;
pub mod shop;

pub mod funding;
pub mod settlement;
pub mod sync;
pub mod upstream;
pub mod webhook;

pub mod deps;
pub mod gateway;

#[cfg(test)]
mod integration_tests;

// Convenient re-exports at crate root
pub use core_types::{OrderSn, PrincipalId, Role, ShopId};
pub use deps::{Deps, LedgerCore, Workers};
pub use error::{ErrorKind, LedgerError, LedgerResult};

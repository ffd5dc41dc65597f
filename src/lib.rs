//! custody_sentinel - custodial multi-chain deposit and settlement engine
//!
//! Derives per-user deposit addresses, watches EVM chains and Solana for
//! inbound transfers, credits the ledger once deposits are final, guards
//! against reorgs, sweeps funds into vaults and executes payouts.
//!
//! # Modules
//!
//! - [`core_types`] - Chain, family and id aliases
//! - [`config`] - YAML configuration
//! - [`keys`] - HD derivation and the signing-provider seam
//! - [`chain`] - Chain adapters (EVM JSON-RPC, Solana JSON-RPC)
//! - [`ledger`] - Ledger store contract, in-memory and PostgreSQL stores
//! - [`allocator`] - Deposit address allocation
//! - [`sentinel`] - Per-chain watchers, confirmation tracking, crediting
//! - [`reorg`] - Reorg guard (pre- and post-credit passes)
//! - [`sweep`] - Sweep engine
//! - [`settlement`] - Payout creation and execution
//! - [`service`] - Facade wiring everything together

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod error;
pub mod logging;
pub mod money;

pub mod alert;
pub mod keys;
pub mod oracle;
pub mod scheduler;

pub mod chain;
pub mod db;
pub mod ledger;

pub mod allocator;
pub mod reorg;
pub mod sentinel;
pub mod settlement;
pub mod sweep;

pub mod service;


// Convenient re-exports at crate root
pub use allocator::{AddressAllocator, AllocatedAddress};
pub use chain::{ChainAdapter, ChainRegistry};
pub use core_types::{Chain, ChainFamily, UserId};
pub use error::CustodyError;
pub use ledger::{LedgerStore, MemoryLedger, PgLedger};
pub use reorg::{ReorgGuard, ReorgHealth};
pub use sentinel::ChainWatcher;
pub use service::{CustodyService, ServiceDeps};
pub use settlement::SettlementQueue;
pub use sweep::SweepEngine;

//! Sentinel Service Module
//!
//! Watches chains for deposits to user addresses:
//! - one [`ChainWatcher`] per configured chain (EVM family, Solana)
//! - confirmation tracking with monotonic counts
//! - idempotent deposit recording and crediting on threshold

pub mod confirmation;
pub mod pipeline;
pub mod watcher;

pub use confirmation::{ConfirmationMonitor, ConfirmationReport};
pub use pipeline::{DepositPipeline, RecordOutcome, RecordedBatch};
pub use watcher::{ChainWatcher, SkipReason, TickReport};

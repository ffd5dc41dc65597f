//! Key custody
//!
//! Deterministic derivation from one master seed plus a narrowly scoped
//! signing seam. Keys are derived on demand, used, and dropped (zeroized);
//! nothing here caches or logs key material.

pub mod hd;
pub mod signer;

use thiserror::Error;

pub use hd::{KeyBranch, MasterSeed, derive_private_key};
pub use signer::{EvmKey, HdSigningProvider, SigningProvider, SolanaKey};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid master seed: {0}")]
    InvalidSeed(String),

    #[error("Key derivation failed: {0}")]
    Derivation(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

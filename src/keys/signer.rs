//! Signing provider
//!
//! Watchers, sweeps and payouts only ever see this trait. The HD
//! implementation derives from the master seed each call; a KMS/HSM backend
//! can be substituted without touching the callers.

use ed25519_dalek::Signer;
use k256::ecdsa::SigningKey;

use super::KeyError;
use super::hd::{
    KeyBranch, MasterSeed, derive_private_key, evm_address_from_secret,
    solana_address_from_secret,
};
use crate::core_types::{ChainFamily, DerivationIndex};

pub trait SigningProvider: Send + Sync {
    /// Public address for a branch. Never exposes key material.
    fn address(&self, family: ChainFamily, branch: KeyBranch) -> Result<String, KeyError>;

    /// Short-lived secp256k1 signer; drop it as soon as the tx is signed
    fn evm_key(&self, branch: KeyBranch) -> Result<EvmKey, KeyError>;

    /// Short-lived ed25519 signer; drop it as soon as the tx is signed
    fn solana_key(&self, branch: KeyBranch) -> Result<SolanaKey, KeyError>;

    fn deposit_address(
        &self,
        family: ChainFamily,
        index: DerivationIndex,
    ) -> Result<String, KeyError> {
        self.address(family, KeyBranch::Deposit(index))
    }
}

/// secp256k1 signing key; zeroized on drop
pub struct EvmKey {
    key: SigningKey,
    address: String,
}

impl EvmKey {
    pub fn from_secret(secret: &[u8; 32]) -> Result<Self, KeyError> {
        let key = SigningKey::from_slice(secret).map_err(|e| KeyError::Derivation(e.to_string()))?;
        let address = evm_address_from_secret(secret)?;
        Ok(Self { key, address })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sign a 32-byte digest; returns (r||s, recovery id)
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<([u8; 64], u8), KeyError> {
        let (sig, recid) = self
            .key
            .sign_prehash_recoverable(digest)
            .map_err(|e| KeyError::Signing(e.to_string()))?;
        let mut out = [0u8; 64];
        out.copy_from_slice(&sig.to_bytes());
        Ok((out, recid.to_byte()))
    }
}

impl std::fmt::Debug for EvmKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// ed25519 signing key; zeroized on drop
pub struct SolanaKey {
    key: ed25519_dalek::SigningKey,
}

impl SolanaKey {
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(secret),
        }
    }

    pub fn pubkey(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    pub fn address(&self) -> String {
        bs58::encode(self.pubkey()).into_string()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for SolanaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolanaKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Derives every key from the master seed on demand
#[derive(Debug)]
pub struct HdSigningProvider {
    seed: MasterSeed,
}

impl HdSigningProvider {
    pub fn new(seed: MasterSeed) -> Self {
        Self { seed }
    }

    /// Reads the hex seed from an environment variable
    pub fn from_env(var: &str) -> Result<Self, KeyError> {
        let hex_seed = zeroize::Zeroizing::new(
            std::env::var(var).map_err(|_| KeyError::InvalidSeed(format!("{} not set", var)))?,
        );
        Ok(Self::new(MasterSeed::from_hex(&hex_seed)?))
    }
}

impl SigningProvider for HdSigningProvider {
    fn address(&self, family: ChainFamily, branch: KeyBranch) -> Result<String, KeyError> {
        let secret = derive_private_key(&self.seed, family, branch)?;
        match family {
            ChainFamily::Evm => evm_address_from_secret(&secret),
            ChainFamily::Solana => Ok(solana_address_from_secret(&secret)),
        }
    }

    fn evm_key(&self, branch: KeyBranch) -> Result<EvmKey, KeyError> {
        let secret = derive_private_key(&self.seed, ChainFamily::Evm, branch)?;
        EvmKey::from_secret(&secret)
    }

    fn solana_key(&self, branch: KeyBranch) -> Result<SolanaKey, KeyError> {
        let secret = derive_private_key(&self.seed, ChainFamily::Solana, branch)?;
        Ok(SolanaKey::from_secret(&secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> HdSigningProvider {
        HdSigningProvider::new(
            MasterSeed::from_hex("000102030405060708090a0b0c0d0e0f").unwrap(),
        )
    }

    #[test]
    fn test_address_matches_key() {
        let p = provider();
        let addr = p.deposit_address(ChainFamily::Evm, 3).unwrap();
        let key = p.evm_key(KeyBranch::Deposit(3)).unwrap();
        assert_eq!(addr, key.address());
        assert!(addr.starts_with("0x"));
        assert_eq!(addr.len(), 42);

        let sol = p.deposit_address(ChainFamily::Solana, 3).unwrap();
        let sol_key = p.solana_key(KeyBranch::Deposit(3)).unwrap();
        assert_eq!(sol, sol_key.address());
    }

    #[test]
    fn test_vault_differs_from_deposits() {
        let p = provider();
        let vault = p.address(ChainFamily::Evm, KeyBranch::PayoutVault).unwrap();
        let dep0 = p.deposit_address(ChainFamily::Evm, 0).unwrap();
        assert_ne!(vault, dep0);
    }

    #[test]
    fn test_evm_signature_recovers() {
        use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};

        let p = provider();
        let key = p.evm_key(KeyBranch::Deposit(0)).unwrap();
        let digest = [7u8; 32];
        let (sig, v) = key.sign_digest(&digest).unwrap();

        let signature = Signature::from_slice(&sig).unwrap();
        let recid = RecoveryId::from_byte(v).unwrap();
        let recovered = VerifyingKey::recover_from_prehash(&digest, &signature, recid).unwrap();
        assert_eq!(&recovered, key.key.verifying_key());
    }

    #[test]
    fn test_solana_signature_verifies() {
        use ed25519_dalek::{Verifier, VerifyingKey};

        let key = provider().solana_key(KeyBranch::Deposit(1)).unwrap();
        let sig = key.sign(b"hello");
        let vk = VerifyingKey::from_bytes(&key.pubkey()).unwrap();
        assert!(
            vk.verify(b"hello", &ed25519_dalek::Signature::from_bytes(&sig))
                .is_ok()
        );
    }

    #[test]
    fn test_debug_does_not_leak() {
        let key = provider().evm_key(KeyBranch::Deposit(0)).unwrap();
        let dbg = format!("{:?}", key);
        assert!(dbg.contains("address"));
        assert!(!dbg.contains("key:"));
    }
}

//! Hierarchical deterministic derivation
//!
//! * EVM family: BIP-32 over secp256k1, `m/44'/60'/0'/0/{index}`
//! * Solana: SLIP-0010 over ed25519 (hardened only), `m/44'/501'/{index}'/0'`
//!
//! The payout vault keys live on their own branches so they can never
//! collide with a deposit index.

use hmac::{Hmac, Mac};
use k256::elliptic_curve::{Field, PrimeField};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{FieldBytes, Scalar, SecretKey};
use sha2::Sha512;
use sha3::{Digest, Keccak256};
use zeroize::Zeroizing;

use super::KeyError;
use crate::core_types::{ChainFamily, DerivationIndex};

type HmacSha512 = Hmac<Sha512>;

pub const HARDENED: u32 = 0x8000_0000;

const BIP32_SEED_KEY: &[u8] = b"Bitcoin seed";
const SLIP10_ED25519_SEED_KEY: &[u8] = b"ed25519 seed";

const PURPOSE: u32 = 44;
const COIN_TYPE_ETH: u32 = 60;
const COIN_TYPE_SOL: u32 = 501;

/// Which key tree a path belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBranch {
    Deposit(DerivationIndex),
    PayoutVault,
}

/// Full derivation path for a family/branch
pub fn derivation_path(family: ChainFamily, branch: KeyBranch) -> Vec<u32> {
    match (family, branch) {
        (ChainFamily::Evm, KeyBranch::Deposit(i)) => vec![
            PURPOSE | HARDENED,
            COIN_TYPE_ETH | HARDENED,
            HARDENED,
            0,
            i,
        ],
        (ChainFamily::Evm, KeyBranch::PayoutVault) => vec![
            PURPOSE | HARDENED,
            COIN_TYPE_ETH | HARDENED,
            1 | HARDENED,
            0,
            0,
        ],
        (ChainFamily::Solana, KeyBranch::Deposit(i)) => vec![
            PURPOSE | HARDENED,
            COIN_TYPE_SOL | HARDENED,
            i | HARDENED,
            HARDENED,
        ],
        (ChainFamily::Solana, KeyBranch::PayoutVault) => vec![
            PURPOSE | HARDENED,
            COIN_TYPE_SOL | HARDENED,
            HARDENED,
            1 | HARDENED,
        ],
    }
}

pub fn format_path(path: &[u32]) -> String {
    let mut out = String::from("m");
    for c in path {
        if c & HARDENED != 0 {
            out.push_str(&format!("/{}'", c & !HARDENED));
        } else {
            out.push_str(&format!("/{}", c));
        }
    }
    out
}

/// Master secret. Zeroized on drop; `Debug` is redacted.
pub struct MasterSeed(Zeroizing<Vec<u8>>);

impl MasterSeed {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() < 16 || bytes.len() > 64 {
            return Err(KeyError::InvalidSeed(format!(
                "seed must be 16..=64 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(Zeroizing::new(bytes.to_vec())))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = Zeroizing::new(
            hex::decode(hex_str.trim().trim_start_matches("0x"))
                .map_err(|e| KeyError::InvalidSeed(e.to_string()))?,
        );
        Self::from_bytes(&bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for MasterSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSeed(<redacted>)")
    }
}

struct ExtendedKey {
    key: Zeroizing<[u8; 32]>,
    chain_code: Zeroizing<[u8; 32]>,
}

fn hmac_split(key: &[u8], data: &[u8]) -> Result<ExtendedKey, KeyError> {
    let mut mac =
        HmacSha512::new_from_slice(key).map_err(|e| KeyError::Derivation(e.to_string()))?;
    mac.update(data);
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&mac.finalize().into_bytes());

    let mut k = Zeroizing::new([0u8; 32]);
    let mut c = Zeroizing::new([0u8; 32]);
    k.copy_from_slice(&out[..32]);
    c.copy_from_slice(&out[32..]);
    Ok(ExtendedKey {
        key: k,
        chain_code: c,
    })
}

fn secp_scalar(bytes: &[u8; 32]) -> Option<Scalar> {
    Option::from(Scalar::from_repr(FieldBytes::clone_from_slice(bytes)))
}

/// BIP-32 private derivation over secp256k1
fn derive_secp256k1(seed: &[u8], path: &[u32]) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let mut node = hmac_split(BIP32_SEED_KEY, seed)?;
    match secp_scalar(&node.key) {
        Some(s) if !bool::from(s.is_zero()) => {}
        _ => return Err(KeyError::Derivation("invalid master key".into())),
    }

    for &index in path {
        let mut data = Zeroizing::new(Vec::with_capacity(37));
        if index & HARDENED != 0 {
            data.push(0u8);
            data.extend_from_slice(node.key.as_ref());
        } else {
            let secret = SecretKey::from_slice(node.key.as_ref())
                .map_err(|e| KeyError::Derivation(e.to_string()))?;
            let point = secret.public_key().to_encoded_point(true);
            data.extend_from_slice(point.as_bytes());
        }
        data.extend_from_slice(&index.to_be_bytes());

        let child = hmac_split(node.chain_code.as_ref(), &data)?;
        let il = secp_scalar(&child.key).ok_or_else(|| {
            KeyError::Derivation(format!("IL out of range at index {}", index))
        })?;
        let parent = secp_scalar(&node.key)
            .ok_or_else(|| KeyError::Derivation("parent key out of range".into()))?;
        let sum = il + parent;
        if bool::from(sum.is_zero()) {
            return Err(KeyError::Derivation(format!(
                "derived zero key at index {}",
                index
            )));
        }

        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&sum.to_bytes());
        node = ExtendedKey {
            key,
            chain_code: child.chain_code,
        };
    }

    Ok(node.key)
}

/// SLIP-0010 private derivation over ed25519 (hardened indices only)
fn derive_ed25519(seed: &[u8], path: &[u32]) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let mut node = hmac_split(SLIP10_ED25519_SEED_KEY, seed)?;
    for &index in path {
        if index & HARDENED == 0 {
            return Err(KeyError::Derivation(
                "ed25519 supports hardened derivation only".into(),
            ));
        }
        let mut data = Zeroizing::new(Vec::with_capacity(37));
        data.push(0u8);
        data.extend_from_slice(node.key.as_ref());
        data.extend_from_slice(&index.to_be_bytes());
        node = hmac_split(node.chain_code.as_ref(), &data)?;
    }
    Ok(node.key)
}

/// Derive the raw 32-byte private key for a branch.
///
/// The caller owns the returned buffer for the duration of one operation;
/// it is zeroized when dropped. Never cache or log it.
pub fn derive_private_key(
    seed: &MasterSeed,
    family: ChainFamily,
    branch: KeyBranch,
) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let path = derivation_path(family, branch);
    match family {
        ChainFamily::Evm => derive_secp256k1(seed.as_bytes(), &path),
        ChainFamily::Solana => derive_ed25519(seed.as_bytes(), &path),
    }
}

/// EIP-55 checksummed address of a secp256k1 secret
pub fn evm_address_from_secret(secret: &[u8; 32]) -> Result<String, KeyError> {
    let secret =
        SecretKey::from_slice(secret).map_err(|e| KeyError::Derivation(e.to_string()))?;
    let point = secret.public_key().to_encoded_point(false);
    // Drop the 0x04 SEC1 tag
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    Ok(to_checksum_address(&hash[12..]))
}

/// EIP-55 mixed-case encoding of a 20-byte address
pub fn to_checksum_address(addr: &[u8]) -> String {
    let lower = hex::encode(addr);
    let hash = Keccak256::digest(lower.as_bytes());
    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, ch) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
        if ch.is_ascii_alphabetic() && nibble >= 8 {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Base58 public key of an ed25519 secret
pub fn solana_address_from_secret(secret: &[u8; 32]) -> String {
    let signing = ed25519_dalek::SigningKey::from_bytes(secret);
    bs58::encode(signing.verifying_key().to_bytes()).into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BIP32_TV1_SEED: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn test_bip32_vector_1() {
        let seed = hex::decode(BIP32_TV1_SEED).unwrap();

        let m = derive_secp256k1(&seed, &[]).unwrap();
        assert_eq!(
            hex::encode(*m),
            "e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35"
        );

        let m_0h = derive_secp256k1(&seed, &[HARDENED]).unwrap();
        assert_eq!(
            hex::encode(*m_0h),
            "edb2e14f9ee77d26dd93b4ecede8d16ed408ce149b6cd80b0715a2d911a0afea"
        );

        // Non-hardened child exercises the public-point branch
        let m_0h_1 = derive_secp256k1(&seed, &[HARDENED, 1]).unwrap();
        assert_eq!(
            hex::encode(*m_0h_1),
            "3c6cb8d0f6a264c91ea8b5030fadaa8e538b020f0a387421a12de9319dc93368"
        );
    }

    #[test]
    fn test_slip10_ed25519_vector_1() {
        let seed = hex::decode(BIP32_TV1_SEED).unwrap();

        let m = derive_ed25519(&seed, &[]).unwrap();
        assert_eq!(
            hex::encode(*m),
            "2b4be7f19ee27bbf30c667b642d5f4aa69fd169872f8fc3059c08ebae2eb19e7"
        );

        let m_0h = derive_ed25519(&seed, &[HARDENED]).unwrap();
        assert_eq!(
            hex::encode(*m_0h),
            "68e0fe46dfb67e368c75379acec591dad19df3cde26e63b93a8e704f1dade7a3"
        );
    }

    #[test]
    fn test_ed25519_rejects_normal_index() {
        let seed = hex::decode(BIP32_TV1_SEED).unwrap();
        assert!(derive_ed25519(&seed, &[1]).is_err());
    }

    #[test]
    fn test_evm_address_of_key_one() {
        let mut secret = [0u8; 32];
        secret[31] = 1;
        assert_eq!(
            evm_address_from_secret(&secret).unwrap(),
            "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf"
        );
    }

    #[test]
    fn test_paths() {
        assert_eq!(
            format_path(&derivation_path(ChainFamily::Evm, KeyBranch::Deposit(7))),
            "m/44'/60'/0'/0/7"
        );
        assert_eq!(
            format_path(&derivation_path(ChainFamily::Solana, KeyBranch::Deposit(3))),
            "m/44'/501'/3'/0'"
        );
        assert_ne!(
            derivation_path(ChainFamily::Solana, KeyBranch::PayoutVault),
            derivation_path(ChainFamily::Solana, KeyBranch::Deposit(0))
        );
    }

    #[test]
    fn test_derivation_is_deterministic_and_distinct() {
        let seed = MasterSeed::from_hex(BIP32_TV1_SEED).unwrap();
        let a = derive_private_key(&seed, ChainFamily::Evm, KeyBranch::Deposit(0)).unwrap();
        let b = derive_private_key(&seed, ChainFamily::Evm, KeyBranch::Deposit(0)).unwrap();
        let c = derive_private_key(&seed, ChainFamily::Evm, KeyBranch::Deposit(1)).unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn test_seed_debug_redacted() {
        let seed = MasterSeed::from_hex(BIP32_TV1_SEED).unwrap();
        assert_eq!(format!("{:?}", seed), "MasterSeed(<redacted>)");
        assert!(MasterSeed::from_hex("00").is_err());
    }
}

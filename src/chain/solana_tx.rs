//! Solana transaction encoding
//!
//! Legacy messages with a single fee-paying signer, plus the three
//! instructions custody needs: system transfer, SPL `TransferChecked` and
//! associated-token-account create-idempotent.

use curve25519_dalek::edwards::CompressedEdwardsY;
use sha2::{Digest, Sha256};

use super::ChainError;
use crate::keys::SolanaKey;

pub type Pubkey = [u8; 32];

pub const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";
pub const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
pub const ASSOCIATED_TOKEN_PROGRAM_ID: &str = "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL";

/// Fee per signature, lamports
pub const LAMPORTS_PER_SIGNATURE: u64 = 5_000;
/// SPL token account size, for rent-exemption queries
pub const TOKEN_ACCOUNT_LEN: u64 = 165;

const PDA_MARKER: &[u8] = b"ProgramDerivedAddress";

pub fn decode_pubkey(s: &str) -> Result<Pubkey, ChainError> {
    let bytes = bs58::decode(s)
        .into_vec()
        .map_err(|_| ChainError::InvalidAddress(s.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ChainError::InvalidAddress(s.to_string()))
}

pub fn encode_pubkey(key: &Pubkey) -> String {
    bs58::encode(key).into_string()
}

fn program_id(s: &str) -> Result<Pubkey, ChainError> {
    decode_pubkey(s)
}

/// Solana "shortvec" length prefix
pub fn compact_u16(mut value: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        byte |= 0x80;
        out.push(byte);
    }
}

fn compact_len(len: usize) -> Result<Vec<u8>, ChainError> {
    let len = u16::try_from(len)
        .map_err(|_| ChainError::Parse(format!("array too long for shortvec: {}", len)))?;
    Ok(compact_u16(len))
}

fn is_on_curve(bytes: &Pubkey) -> bool {
    CompressedEdwardsY(*bytes).decompress().is_some()
}

/// Program-derived address and bump seed
pub fn find_program_address(seeds: &[&[u8]], program: &Pubkey) -> Option<(Pubkey, u8)> {
    for bump in (0..=u8::MAX).rev() {
        let mut hasher = Sha256::new();
        for seed in seeds {
            hasher.update(seed);
        }
        hasher.update([bump]);
        hasher.update(program);
        hasher.update(PDA_MARKER);
        let candidate: Pubkey = hasher.finalize().into();
        if !is_on_curve(&candidate) {
            return Some((candidate, bump));
        }
    }
    None
}

pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Result<Pubkey, ChainError> {
    let token_program = program_id(TOKEN_PROGRAM_ID)?;
    let ata_program = program_id(ASSOCIATED_TOKEN_PROGRAM_ID)?;
    find_program_address(
        &[owner.as_slice(), token_program.as_slice(), mint.as_slice()],
        &ata_program,
    )
    .map(|(address, _)| address)
    .ok_or_else(|| ChainError::InvalidAddress("no associated token address".to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountMeta {
    pub pubkey: Pubkey,
    pub is_signer: bool,
    pub is_writable: bool,
}

impl AccountMeta {
    pub fn writable(pubkey: Pubkey, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: true,
        }
    }

    pub fn readonly(pubkey: Pubkey, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub program_id: Pubkey,
    pub accounts: Vec<AccountMeta>,
    pub data: Vec<u8>,
}

pub fn system_transfer(from: &Pubkey, to: &Pubkey, lamports: u64) -> Result<Instruction, ChainError> {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&2u32.to_le_bytes());
    data.extend_from_slice(&lamports.to_le_bytes());
    Ok(Instruction {
        program_id: program_id(SYSTEM_PROGRAM_ID)?,
        accounts: vec![
            AccountMeta::writable(*from, true),
            AccountMeta::writable(*to, false),
        ],
        data,
    })
}

pub fn token_transfer_checked(
    source: &Pubkey,
    mint: &Pubkey,
    destination: &Pubkey,
    owner: &Pubkey,
    amount: u64,
    decimals: u8,
) -> Result<Instruction, ChainError> {
    let mut data = Vec::with_capacity(10);
    data.push(12);
    data.extend_from_slice(&amount.to_le_bytes());
    data.push(decimals);
    Ok(Instruction {
        program_id: program_id(TOKEN_PROGRAM_ID)?,
        accounts: vec![
            AccountMeta::writable(*source, false),
            AccountMeta::readonly(*mint, false),
            AccountMeta::writable(*destination, false),
            AccountMeta::readonly(*owner, true),
        ],
        data,
    })
}

/// Create `owner`'s associated token account for `mint` unless it exists
pub fn create_associated_token_account_idempotent(
    payer: &Pubkey,
    owner: &Pubkey,
    mint: &Pubkey,
) -> Result<Instruction, ChainError> {
    let ata = associated_token_address(owner, mint)?;
    Ok(Instruction {
        program_id: program_id(ASSOCIATED_TOKEN_PROGRAM_ID)?,
        accounts: vec![
            AccountMeta::writable(*payer, true),
            AccountMeta::writable(ata, false),
            AccountMeta::readonly(*owner, false),
            AccountMeta::readonly(*mint, false),
            AccountMeta::readonly(program_id(SYSTEM_PROGRAM_ID)?, false),
            AccountMeta::readonly(program_id(TOKEN_PROGRAM_ID)?, false),
        ],
        data: vec![1],
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CompiledInstruction {
    program_index: u8,
    accounts: Vec<u8>,
    data: Vec<u8>,
}

/// Compiled legacy message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub num_required_signatures: u8,
    pub num_readonly_signed: u8,
    pub num_readonly_unsigned: u8,
    pub account_keys: Vec<Pubkey>,
    pub recent_blockhash: [u8; 32],
    instructions: Vec<CompiledInstruction>,
}

impl Message {
    /// Order keys as signer-writable (payer first), signer-readonly,
    /// writable, readonly; each group in first-seen order.
    pub fn compile(
        payer: &Pubkey,
        instructions: &[Instruction],
        recent_blockhash: [u8; 32],
    ) -> Result<Self, ChainError> {
        let mut metas: Vec<AccountMeta> = vec![AccountMeta::writable(*payer, true)];
        let mut merge = |meta: AccountMeta| match metas.iter_mut().find(|m| m.pubkey == meta.pubkey)
        {
            Some(existing) => {
                existing.is_signer |= meta.is_signer;
                existing.is_writable |= meta.is_writable;
            }
            None => metas.push(meta),
        };
        for ix in instructions {
            for meta in &ix.accounts {
                merge(meta.clone());
            }
            merge(AccountMeta::readonly(ix.program_id, false));
        }

        let group = |m: &AccountMeta| match (m.is_signer, m.is_writable) {
            (true, true) => 0,
            (true, false) => 1,
            (false, true) => 2,
            (false, false) => 3,
        };
        // stable sort keeps the payer first within its group
        metas.sort_by_key(group);

        let count = |g: u8| metas.iter().filter(|&m| group(m) == g).count();
        let narrow = |n: usize| {
            u8::try_from(n).map_err(|_| ChainError::Parse("too many accounts".to_string()))
        };
        let account_keys: Vec<Pubkey> = metas.iter().map(|m| m.pubkey).collect();

        let index_of = |key: &Pubkey| -> Result<u8, ChainError> {
            let pos = account_keys
                .iter()
                .position(|k| k == key)
                .ok_or_else(|| ChainError::Parse("instruction account missing".to_string()))?;
            narrow(pos)
        };
        let compiled = instructions
            .iter()
            .map(|ix| {
                Ok(CompiledInstruction {
                    program_index: index_of(&ix.program_id)?,
                    accounts: ix
                        .accounts
                        .iter()
                        .map(|m| index_of(&m.pubkey))
                        .collect::<Result<_, ChainError>>()?,
                    data: ix.data.clone(),
                })
            })
            .collect::<Result<Vec<_>, ChainError>>()?;

        Ok(Self {
            num_required_signatures: narrow(count(0) + count(1))?,
            num_readonly_signed: narrow(count(1))?,
            num_readonly_unsigned: narrow(count(3))?,
            account_keys,
            recent_blockhash,
            instructions: compiled,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ChainError> {
        let mut out = vec![
            self.num_required_signatures,
            self.num_readonly_signed,
            self.num_readonly_unsigned,
        ];
        out.extend(compact_len(self.account_keys.len())?);
        for key in &self.account_keys {
            out.extend_from_slice(key);
        }
        out.extend_from_slice(&self.recent_blockhash);
        out.extend(compact_len(self.instructions.len())?);
        for ix in &self.instructions {
            out.push(ix.program_index);
            out.extend(compact_len(ix.accounts.len())?);
            out.extend_from_slice(&ix.accounts);
            out.extend(compact_len(ix.data.len())?);
            out.extend_from_slice(&ix.data);
        }
        Ok(out)
    }

    /// Sign with the fee payer and return the wire transaction and its
    /// signature (the transaction id).
    pub fn sign(&self, payer: &SolanaKey) -> Result<(Vec<u8>, String), ChainError> {
        if self.num_required_signatures != 1 {
            return Err(ChainError::Parse(format!(
                "expected a single signer, message needs {}",
                self.num_required_signatures
            )));
        }
        if self.account_keys.first() != Some(&payer.pubkey()) {
            return Err(ChainError::Parse("signer is not the fee payer".to_string()));
        }
        let message = self.serialize()?;
        let signature = payer.sign(&message);

        let mut wire = compact_u16(1);
        wire.extend_from_slice(&signature);
        wire.extend_from_slice(&message);
        Ok((wire, bs58::encode(signature).into_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    #[test]
    fn test_compact_u16() {
        assert_eq!(compact_u16(0), vec![0x00]);
        assert_eq!(compact_u16(0x7f), vec![0x7f]);
        assert_eq!(compact_u16(0x80), vec![0x80, 0x01]);
        assert_eq!(compact_u16(0x3fff), vec![0xff, 0x7f]);
        assert_eq!(compact_u16(0x4000), vec![0x80, 0x80, 0x01]);
    }

    #[test]
    fn test_program_ids_decode() {
        assert_eq!(program_id(SYSTEM_PROGRAM_ID).unwrap(), [0u8; 32]);
        assert!(program_id(TOKEN_PROGRAM_ID).is_ok());
        assert!(program_id(ASSOCIATED_TOKEN_PROGRAM_ID).is_ok());
        assert!(decode_pubkey("not-base58!").is_err());
    }

    #[test]
    fn test_associated_token_address_is_off_curve_and_stable() {
        let owner = SolanaKey::from_secret(&[7u8; 32]).pubkey();
        let other = SolanaKey::from_secret(&[8u8; 32]).pubkey();
        let mint = [9u8; 32];
        let ata = associated_token_address(&owner, &mint).unwrap();
        assert!(!is_on_curve(&ata));
        assert_eq!(ata, associated_token_address(&owner, &mint).unwrap());
        assert_ne!(ata, associated_token_address(&other, &mint).unwrap());
        assert!(is_on_curve(&owner));
    }

    #[test]
    fn test_system_transfer_layout() {
        let key = SolanaKey::from_secret(&[1u8; 32]);
        let to = [2u8; 32];
        let ix = system_transfer(&key.pubkey(), &to, 1_000).unwrap();
        assert_eq!(ix.data[..4], [2, 0, 0, 0]);
        assert_eq!(ix.data[4..], 1_000u64.to_le_bytes());

        let msg = Message::compile(&key.pubkey(), &[ix], [3u8; 32]).unwrap();
        assert_eq!(msg.num_required_signatures, 1);
        assert_eq!(msg.num_readonly_signed, 0);
        assert_eq!(msg.num_readonly_unsigned, 1);
        assert_eq!(msg.account_keys, vec![key.pubkey(), to, [0u8; 32]]);
    }

    #[test]
    fn test_token_transfer_account_order() {
        let owner = SolanaKey::from_secret(&[1u8; 32]);
        let payer = owner.pubkey();
        let dest_owner = [4u8; 32];
        let mint = [5u8; 32];
        let source = associated_token_address(&payer, &mint).unwrap();
        let dest = associated_token_address(&dest_owner, &mint).unwrap();

        let ixs = vec![
            create_associated_token_account_idempotent(&payer, &dest_owner, &mint).unwrap(),
            token_transfer_checked(&source, &mint, &dest, &payer, 42, 6).unwrap(),
        ];
        let msg = Message::compile(&payer, &ixs, [0u8; 32]).unwrap();

        assert_eq!(msg.num_required_signatures, 1);
        assert_eq!(msg.account_keys[0], payer);
        // dest ATA and source ATA are the writable non-signers
        assert_eq!(msg.account_keys[1], dest);
        assert_eq!(msg.account_keys[2], source);
        // dest owner, mint, system, token program, ATA program
        assert_eq!(msg.num_readonly_unsigned, 5);
        assert_eq!(msg.account_keys.len(), 8);
    }

    #[test]
    fn test_signed_transaction_verifies() {
        let key = SolanaKey::from_secret(&[11u8; 32]);
        let ix = system_transfer(&key.pubkey(), &[2u8; 32], 5).unwrap();
        let msg = Message::compile(&key.pubkey(), &[ix], [3u8; 32]).unwrap();
        let (wire, txid) = msg.sign(&key).unwrap();

        assert_eq!(wire[0], 1);
        let sig_bytes: [u8; 64] = wire[1..65].try_into().unwrap();
        assert_eq!(txid, bs58::encode(sig_bytes).into_string());
        let vk = VerifyingKey::from_bytes(&key.pubkey()).unwrap();
        vk.verify(&wire[65..], &Signature::from_bytes(&sig_bytes))
            .unwrap();
        assert_eq!(&wire[65..], &msg.serialize().unwrap()[..]);
    }

    #[test]
    fn test_sign_rejects_foreign_payer() {
        let key = SolanaKey::from_secret(&[11u8; 32]);
        let other = SolanaKey::from_secret(&[12u8; 32]);
        let ix = system_transfer(&key.pubkey(), &[2u8; 32], 5).unwrap();
        let msg = Message::compile(&key.pubkey(), &[ix], [3u8; 32]).unwrap();
        assert!(msg.sign(&other).is_err());
    }
}

//! EVM transaction encoding
//!
//! Legacy (type 0) transactions signed per EIP-155, RLP encoding and the
//! ERC-20 calls the custody flows need.

use sha3::{Digest, Keccak256};

use super::ChainError;
use crate::keys::EvmKey;

/// `transfer(address,uint256)`
pub const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
/// `balanceOf(address)`
pub const ERC20_BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_EVENT_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

pub const NATIVE_TRANSFER_GAS: u64 = 21_000;
pub const TOKEN_TRANSFER_GAS: u64 = 65_000;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Parse a `0x` 20-byte address
pub fn parse_address(s: &str) -> Result<[u8; 20], ChainError> {
    let bytes = hex::decode(s.trim_start_matches("0x"))
        .map_err(|_| ChainError::InvalidAddress(s.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ChainError::InvalidAddress(s.to_string()))
}

/// Address as a left-padded 32-byte word / topic
pub fn address_word(address: &[u8; 20]) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address);
    word
}

pub fn address_topic(address: &[u8; 20]) -> String {
    format!("0x{}", hex::encode(address_word(address)))
}

/// Last 20 bytes of a 32-byte topic, lowercase `0x` hex
pub fn topic_to_address(topic: &str) -> Result<String, ChainError> {
    let digits = topic.trim_start_matches("0x");
    if digits.len() != 64 {
        return Err(ChainError::Parse(format!("bad address topic '{}'", topic)));
    }
    Ok(format!("0x{}", digits[24..].to_lowercase()))
}

fn u128_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

pub fn erc20_transfer_data(to: &[u8; 20], amount: u128) -> Vec<u8> {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&ERC20_TRANSFER_SELECTOR);
    data.extend_from_slice(&address_word(to));
    data.extend_from_slice(&u128_word(amount));
    data
}

pub fn erc20_balance_of_data(owner: &[u8; 20]) -> Vec<u8> {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&ERC20_BALANCE_OF_SELECTOR);
    data.extend_from_slice(&address_word(owner));
    data
}

// --- RLP ---

fn be_bytes_trimmed(value: u128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

fn rlp_length_prefix(len: usize, short_base: u8, long_base: u8) -> Vec<u8> {
    if len <= 55 {
        vec![short_base + len as u8]
    } else {
        let len_bytes = be_bytes_trimmed(len as u128);
        let mut out = vec![long_base + len_bytes.len() as u8];
        out.extend_from_slice(&len_bytes);
        out
    }
}

pub fn rlp_bytes(data: &[u8]) -> Vec<u8> {
    if data.len() == 1 && data[0] < 0x80 {
        return vec![data[0]];
    }
    let mut out = rlp_length_prefix(data.len(), 0x80, 0xb7);
    out.extend_from_slice(data);
    out
}

pub fn rlp_uint(value: u128) -> Vec<u8> {
    rlp_bytes(&be_bytes_trimmed(value))
}

pub fn rlp_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload: Vec<u8> = items.concat();
    let mut out = rlp_length_prefix(payload.len(), 0xc0, 0xf7);
    out.extend_from_slice(&payload);
    out
}

/// Legacy transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTx {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: [u8; 20],
    pub value: u128,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTx {
    fn base_fields(&self) -> Vec<Vec<u8>> {
        vec![
            rlp_uint(self.nonce as u128),
            rlp_uint(self.gas_price),
            rlp_uint(self.gas_limit as u128),
            rlp_bytes(&self.to),
            rlp_uint(self.value),
            rlp_bytes(&self.data),
        ]
    }

    /// EIP-155 signing payload: `rlp([..fields, chain_id, 0, 0])`
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut fields = self.base_fields();
        fields.push(rlp_uint(self.chain_id as u128));
        fields.push(rlp_uint(0));
        fields.push(rlp_uint(0));
        rlp_list(&fields)
    }

    pub fn signing_hash(&self) -> [u8; 32] {
        keccak256(&self.signing_payload())
    }

    /// Raw signed transaction bytes, ready for `eth_sendRawTransaction`
    pub fn sign(&self, key: &EvmKey) -> Result<Vec<u8>, ChainError> {
        let (sig, recid) = key.sign_digest(&self.signing_hash())?;
        let v = self.chain_id as u128 * 2 + 35 + recid as u128;
        let r = trim_word(&sig[..32]);
        let s = trim_word(&sig[32..]);

        let mut fields = self.base_fields();
        fields.push(rlp_uint(v));
        fields.push(rlp_bytes(&r));
        fields.push(rlp_bytes(&s));
        Ok(rlp_list(&fields))
    }
}

/// 32-byte big-endian scalar with leading zeros stripped (RLP integer form)
fn trim_word(word: &[u8]) -> Vec<u8> {
    let first = word.iter().position(|b| *b != 0).unwrap_or(word.len());
    word[first..].to_vec()
}

pub fn tx_hash(raw: &[u8]) -> String {
    format!("0x{}", hex::encode(keccak256(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rlp_basics() {
        assert_eq!(rlp_uint(0), vec![0x80]);
        assert_eq!(rlp_uint(0x0f), vec![0x0f]);
        assert_eq!(rlp_uint(0x400), vec![0x82, 0x04, 0x00]);
        assert_eq!(rlp_bytes(b"dog"), vec![0x83, b'd', b'o', b'g']);
        assert_eq!(
            rlp_list(&[rlp_bytes(b"cat"), rlp_bytes(b"dog")]),
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );
        assert_eq!(rlp_list(&[]), vec![0xc0]);
    }

    #[test]
    fn test_rlp_long_string() {
        let data = vec![b'a'; 56];
        let encoded = rlp_bytes(&data);
        assert_eq!(&encoded[..2], &[0xb8, 56]);
        assert_eq!(encoded.len(), 58);
    }

    fn eip155_example() -> LegacyTx {
        LegacyTx {
            nonce: 9,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: [0x35; 20],
            value: 1_000_000_000_000_000_000,
            data: vec![],
            chain_id: 1,
        }
    }

    #[test]
    fn test_eip155_signing_payload() {
        let tx = eip155_example();
        assert_eq!(
            hex::encode(tx.signing_payload()),
            "ec098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a764000080018080"
        );
        assert_eq!(
            hex::encode(tx.signing_hash()),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn test_signed_tx_recovers_sender() {
        use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};

        let key = EvmKey::from_secret(&[0x46; 32]).unwrap();
        let tx = eip155_example();
        let raw = tx.sign(&key).unwrap();
        // long-list header, payload under 256 bytes
        assert_eq!(raw[0], 0xf8);
        assert_eq!(raw[1] as usize, raw.len() - 2);
        let digest = tx.signing_hash();
        let (sig, recid) = key.sign_digest(&digest).unwrap();
        let recovered = VerifyingKey::recover_from_prehash(
            &digest,
            &Signature::from_slice(&sig).unwrap(),
            RecoveryId::from_byte(recid).unwrap(),
        )
        .unwrap();
        let point = recovered.to_encoded_point(false);
        let addr = &keccak256(&point.as_bytes()[1..])[12..];
        assert_eq!(
            format!("0x{}", hex::encode(addr)),
            key.address().to_lowercase()
        );
    }

    #[test]
    fn test_erc20_transfer_calldata() {
        let to = parse_address("0x00000000000000000000000000000000000000aa").unwrap();
        let data = erc20_transfer_data(&to, 1_000_000);
        assert_eq!(data.len(), 68);
        assert_eq!(&data[..4], &ERC20_TRANSFER_SELECTOR);
        assert_eq!(data[35], 0xaa);
        assert_eq!(&data[64..], &1_000_000u32.to_be_bytes());
    }

    #[test]
    fn test_topic_address_roundtrip() {
        let addr = parse_address("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045").unwrap();
        let topic = address_topic(&addr);
        assert_eq!(topic.len(), 66);
        assert_eq!(
            topic_to_address(&topic).unwrap(),
            "0xd8da6bf26964af9d7eed9e03e53415d37aa96045"
        );
        assert!(parse_address("0x1234").is_err());
    }

    #[test]
    fn test_transfer_topic_constant() {
        assert_eq!(
            format!(
                "0x{}",
                hex::encode(keccak256(b"Transfer(address,address,uint256)"))
            ),
            TRANSFER_EVENT_TOPIC
        );
    }
}

use bytes::BufMut;
use ethereum_types::{H256, U256};
use vela_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};

use crate::constants::{EMPTY_CODE_HASH, EMPTY_TRIE_HASH};

/// Account state as stored in the state trie (consensus format).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountState {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: H256,
    pub code_hash: H256,
}

impl AccountState {
    /// Creates an account with no code and no storage.
    pub fn empty() -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            storage_root: EMPTY_TRIE_HASH,
            code_hash: EMPTY_CODE_HASH,
        }
    }

    pub fn has_code(&self) -> bool {
        self.code_hash != EMPTY_CODE_HASH
    }

    pub fn has_storage(&self) -> bool {
        self.storage_root != EMPTY_TRIE_HASH
    }
}

impl RLPEncode for AccountState {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.nonce)
            .encode_field(&self.balance)
            .encode_field(&self.storage_root)
            .encode_field(&self.code_hash)
            .finish();
    }
}

impl RLPDecode for AccountState {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (balance, decoder) = decoder.decode_field("balance")?;
        let (storage_root, decoder) = decoder.decode_field("storage_root")?;
        let (code_hash, decoder) = decoder.decode_field("code_hash")?;
        let remaining = decoder.finish()?;
        Ok((
            Self {
                nonce,
                balance,
                storage_root,
                code_hash,
            },
            remaining,
        ))
    }
}

/// Encodes an account in the compact "slim" snapshot format: the storage root
/// and code hash become the empty byte string when they equal their sentinel
/// values, shaving 64 bytes off the common EOA case.
pub fn slim_account_rlp(account: &AccountState) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut encoder = Encoder::new(&mut buf)
        .encode_field(&account.nonce)
        .encode_field(&account.balance);
    if account.storage_root != EMPTY_TRIE_HASH {
        encoder = encoder.encode_bytes(account.storage_root.as_bytes());
    } else {
        encoder = encoder.encode_bytes(&[]);
    }
    if account.code_hash != EMPTY_CODE_HASH {
        encoder = encoder.encode_bytes(account.code_hash.as_bytes());
    } else {
        encoder = encoder.encode_bytes(&[]);
    }
    encoder.finish();
    buf
}

/// Decodes slim-format data back into a consensus-format account, restoring
/// the sentinel root and code hash for the elided fields.
pub fn full_account(data: &[u8]) -> Result<AccountState, RLPDecodeError> {
    let decoder = Decoder::new(data)?;
    let (nonce, decoder) = decoder.decode_field("nonce")?;
    let (balance, decoder) = decoder.decode_field("balance")?;
    let (root, decoder) = decoder.decode_field::<Vec<u8>>("storage_root")?;
    let (code_hash, decoder) = decoder.decode_field::<Vec<u8>>("code_hash")?;
    decoder.finish()?;

    let storage_root = match root.len() {
        0 => EMPTY_TRIE_HASH,
        32 => H256::from_slice(&root),
        _ => return Err(RLPDecodeError::InvalidLength),
    };
    let code_hash = match code_hash.len() {
        0 => EMPTY_CODE_HASH,
        32 => H256::from_slice(&code_hash),
        _ => return Err(RLPDecodeError::InvalidLength),
    };
    Ok(AccountState {
        nonce,
        balance,
        storage_root,
        code_hash,
    })
}

/// Converts slim-format data into the full consensus RLP encoding.
pub fn full_account_rlp(data: &[u8]) -> Result<Vec<u8>, RLPDecodeError> {
    Ok(full_account(data)?.encode_to_vec())
}

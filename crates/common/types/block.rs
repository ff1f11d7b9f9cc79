use bytes::Bytes;
use ethereum_types::H256;
use thiserror::Error;

/// Size of a serialized aggregate BLS signature.
pub const BLS_SIGNATURE_BYTES: usize = 96;

/// Aggregate BLS commit signature over a block.
pub type CommitSignature = [u8; BLS_SIGNATURE_BYTES];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid commit signature payload: {0} bytes")]
pub struct CommitSigError(pub usize);

/// Header of a shard block. Only the fields the sync needs are modeled here;
/// the header chain itself is maintained by the host node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: H256,
    pub number: u64,
    pub state_root: H256,
    pub timestamp: u64,
    /// Aggregate signature over the parent block's commit.
    pub last_commit_signature: CommitSignature,
    /// Signer bitmap matching `last_commit_signature`.
    pub last_commit_bitmap: Bytes,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            parent_hash: H256::zero(),
            number: 0,
            state_root: H256::zero(),
            timestamp: 0,
            last_commit_signature: [0u8; BLS_SIGNATURE_BYTES],
            last_commit_bitmap: Bytes::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    /// Trailing commit of this block itself, only set on the chain tip where
    /// no child header exists yet to carry the last-commit.
    pub current_commit_sig: Bytes,
}

impl Block {
    pub fn number(&self) -> u64 {
        self.header.number
    }
}

/// Splits a raw commit payload into the aggregate signature and signer bitmap.
pub fn parse_commit_sig_and_bitmap(
    payload: &[u8],
) -> Result<(CommitSignature, Bytes), CommitSigError> {
    if payload.len() < BLS_SIGNATURE_BYTES {
        return Err(CommitSigError(payload.len()));
    }
    let mut sig = [0u8; BLS_SIGNATURE_BYTES];
    sig.copy_from_slice(&payload[..BLS_SIGNATURE_BYTES]);
    let bitmap = Bytes::copy_from_slice(&payload[BLS_SIGNATURE_BYTES..]);
    Ok((sig, bitmap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_commit_sig_splits_signature_and_bitmap() {
        let mut payload = vec![0xabu8; BLS_SIGNATURE_BYTES];
        payload.extend_from_slice(&[0x01, 0x02, 0x03]);
        let (sig, bitmap) = parse_commit_sig_and_bitmap(&payload).unwrap();
        assert_eq!(sig, [0xab; BLS_SIGNATURE_BYTES]);
        assert_eq!(bitmap.as_ref(), &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn parse_commit_sig_rejects_short_payload() {
        assert_eq!(
            parse_commit_sig_and_bitmap(&[0u8; 10]),
            Err(CommitSigError(10))
        );
    }
}

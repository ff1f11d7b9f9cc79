//! Verification and insertion of downloaded blocks. Each block's aggregate
//! commit signature lives in its successor's header; only the chain tip
//! carries its own trailing commit.

use vela_common::types::{parse_commit_sig_and_bitmap, Block};

use crate::chain::{BlockChain, SigVerifyError};
use crate::SyncError;

/// Verifies and inserts blocks in order, stopping at the first failure.
/// Returns how many blocks made it in, along with the error that stopped the
/// run, if any.
pub fn verify_and_insert_blocks(
    chain: &dyn BlockChain,
    blocks: &[Block],
) -> (usize, Option<SyncError>) {
    for (i, block) in blocks.iter().enumerate() {
        if let Err(err) = verify_and_insert_block(chain, block, blocks.get(i + 1)) {
            return (i, Some(err));
        }
    }
    (blocks.len(), None)
}

/// Verifies one block's commit signature and header, then appends it to the
/// chain. When the next block is known, its last-commit attests to this one;
/// otherwise the block's own trailing commit is used.
pub fn verify_and_insert_block(
    chain: &dyn BlockChain,
    block: &Block,
    next: Option<&Block>,
) -> Result<(), SyncError> {
    let (signature, bitmap) = match next {
        Some(next) => (
            next.header.last_commit_signature,
            next.header.last_commit_bitmap.clone(),
        ),
        None => parse_commit_sig_and_bitmap(&block.current_commit_sig)?,
    };

    chain
        .engine()
        .verify_header_signature(chain, &block.header, &signature, &bitmap)
        .map_err(|err| SyncError::SigVerify(SigVerifyError(err)))?;
    chain
        .engine()
        .verify_header(chain, &block.header, true)
        .map_err(SyncError::Header)?;
    chain.insert_chain(vec![block.clone()], false)?;
    Ok(())
}

//! Capability seams towards the host chain: header/signature verification by
//! the consensus engine and block insertion into the canonical chain.

use thiserror::Error;
use vela_common::types::{Block, BlockHeader, CommitSignature};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("unknown ancestor")]
    UnknownAncestor,
    #[error("block already known")]
    KnownBlock,
    #[error("{0}")]
    Custom(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid aggregate signature: {0}")]
    InvalidSignature(String),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

/// Commit-signature verification failure, kept as its own type so callers can
/// attribute the block to a bad peer.
#[derive(Debug, Error)]
#[error("commit signature verification: {0}")]
pub struct SigVerifyError(#[source] pub EngineError);

/// The consensus engine's verification surface.
pub trait Engine: Send + Sync {
    fn verify_header_signature(
        &self,
        chain: &dyn BlockChain,
        header: &BlockHeader,
        signature: &CommitSignature,
        bitmap: &[u8],
    ) -> Result<(), EngineError>;

    fn verify_header(
        &self,
        chain: &dyn BlockChain,
        header: &BlockHeader,
        verify_seal: bool,
    ) -> Result<(), EngineError>;
}

/// The shard chain the sync appends to.
pub trait BlockChain: Send + Sync {
    fn shard_id(&self) -> u32;
    fn current_block_number(&self) -> u64;
    fn engine(&self) -> &dyn Engine;
    /// Appends blocks to the chain, returning how many were inserted.
    fn insert_chain(&self, blocks: Vec<Block>, verify_headers: bool) -> Result<usize, ChainError>;
}

//! Snapshot state sync for one shard.
//!
//! Given a state-tree root, the [`state_sync::StateDownloader`] pulls the flat
//! account and storage snapshot from remote peers by hash ranges, rebuilds
//! trie nodes on the fly, and heals the chunk boundaries afterwards. The
//! [`driver::SyncDriver`] waits for enough peers and then repeatedly runs sync
//! cycles against the staged pipeline, feeding verified blocks into the chain.

pub mod beacon;
pub mod block_insert;
pub mod chain;
pub mod constants;
pub mod driver;
pub mod heal_paths;
pub mod metrics;
pub mod range;
pub mod requests;
pub mod stage;
pub mod state_sync;
pub mod tasks;

#[cfg(test)]
mod testutil;

#[cfg(test)]
mod state_sync_tests;

#[cfg(test)]
mod driver_tests;

use thiserror::Error;

use chain::{ChainError, EngineError, SigVerifyError};
use requests::RequestError;
use vela_common::types::CommitSigError;
use vela_rlp::error::RLPDecodeError;
use vela_storage::StoreError;
use vela_trie::TrieError;

pub use driver::{DriverConfig, SyncDriver};
pub use state_sync::StateDownloader;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rlp(#[from] RLPDecodeError),
    #[error(transparent)]
    Trie(#[from] TrieError),
    #[error(transparent)]
    SigVerify(#[from] SigVerifyError),
    #[error("header verification: {0}")]
    Header(#[source] EngineError),
    #[error("chain insert: {0}")]
    InsertChain(#[from] ChainError),
    #[error("parse commit signature: {0}")]
    CommitSig(#[from] CommitSigError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("no task with id {0:#x}")]
    UnknownTask(u64),
    #[error("state root was not set before use")]
    RootNotSet,
    #[error("sync cancelled")]
    Cancelled,
}

//! Wire-facing request and response payloads. Every non-empty slot of a
//! [`DispatchBatch`] maps to exactly one protocol call; responses come back
//! already hash-verified by the protocol layer.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use ethereum_types::H256;
use thiserror::Error;
use vela_common::types::AccountState;

use crate::heal_paths::TrieNodePathSet;

/// Identifies the peer stream a response was served on, for attribution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamId(pub String);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("no suitable peer")]
    NoPeers,
    #[error("peer error: {0}")]
    Peer(String),
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct AccountRangeRequest {
    pub task_id: u64,
    pub root: H256,
    pub origin: H256,
    pub limit: H256,
    /// Response byte budget.
    pub cap: usize,
}

#[derive(Clone, Debug)]
pub struct BytecodeRequest {
    pub task_id: u64,
    pub hashes: Vec<H256>,
}

#[derive(Clone, Debug)]
pub struct StorageRangeRequest {
    /// Bundle id, not the account task id.
    pub id: u64,
    pub root: H256,
    pub accounts: Vec<H256>,
    pub roots: Vec<H256>,
    pub origin: H256,
    pub limit: H256,
    pub cap: usize,
}

#[derive(Clone, Debug)]
pub struct TrienodeHealRequest {
    pub task_id: u64,
    pub root: H256,
    /// Raw paths in dispatch order; response nodes align with these.
    pub paths: Vec<Vec<u8>>,
    pub hashes: Vec<H256>,
    /// Merged per-account path sets as they go on the wire.
    pub pathsets: Vec<TrieNodePathSet>,
}

#[derive(Clone, Debug)]
pub struct BytecodeHealRequest {
    pub task_id: u64,
    pub hashes: Vec<H256>,
}

/// Up to five independent requests produced by one dispatch round.
#[derive(Default)]
pub struct DispatchBatch {
    pub accounts: Vec<AccountRangeRequest>,
    pub codes: Option<BytecodeRequest>,
    pub storages: Option<StorageRangeRequest>,
    pub healtask: Option<TrienodeHealRequest>,
    pub codetask: Option<BytecodeHealRequest>,
}

impl DispatchBatch {
    /// Number of work items carried across all slots.
    pub fn len(&self) -> usize {
        self.accounts.len()
            + self.codes.as_ref().map_or(0, |c| c.hashes.len())
            + self.storages.as_ref().map_or(0, |s| s.accounts.len())
            + self.healtask.as_ref().map_or(0, |h| h.hashes.len())
            + self.codetask.as_ref().map_or(0, |c| c.hashes.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct AccountRangeResponse {
    pub hashes: Vec<H256>,
    pub accounts: Vec<AccountState>,
    /// More accounts exist past the returned slice within the interval.
    pub cont: bool,
}

pub struct BytecodeResponse {
    /// Aligned with the request hashes; `None` marks an undelivered code.
    pub codes: Vec<Option<Bytes>>,
}

pub struct StorageRangeResponse {
    /// Slot hashes per requested account; may cover only a prefix of the
    /// requested accounts.
    pub hashes: Vec<Vec<H256>>,
    pub slots: Vec<Vec<Bytes>>,
    /// The last account's range has a continuation.
    pub cont: bool,
}

pub struct TrienodeHealResponse {
    /// Aligned with the request paths; `None` marks an undelivered node.
    pub nodes: Vec<Option<Bytes>>,
}

pub struct BytecodeHealResponse {
    pub codes: Vec<Option<Bytes>>,
}

/// A failed dispatch, routed back so the work re-queues for retry.
#[derive(Debug)]
pub enum FailedRequest {
    Accounts(Vec<u64>),
    Codes { task_id: u64, hashes: Vec<H256> },
    Storages(u64),
    TrienodeHeal(u64),
    BytecodeHeal(u64),
}

/// The peer-facing side of the sync protocol. Implementations pick a peer,
/// perform the exchange and verify the response hashes against the request
/// root before returning.
#[async_trait]
pub trait SnapPeerClient: Send + Sync {
    async fn get_account_range(
        &self,
        req: &AccountRangeRequest,
    ) -> Result<(AccountRangeResponse, StreamId), RequestError>;

    async fn get_byte_codes(
        &self,
        hashes: &[H256],
        cap: usize,
    ) -> Result<(BytecodeResponse, StreamId), RequestError>;

    async fn get_storage_ranges(
        &self,
        req: &StorageRangeRequest,
    ) -> Result<(StorageRangeResponse, StreamId), RequestError>;

    async fn get_trie_nodes(
        &self,
        req: &TrienodeHealRequest,
    ) -> Result<(TrienodeHealResponse, StreamId), RequestError>;
}

//! Seams between the state sync and the trie machinery.
//!
//! The sync never hashes trie nodes itself: range responses are folded through
//! a streaming [`StackTrie`] builder, and the heal phase is driven by a
//! [`TrieScheduler`] that knows which nodes are still missing under the target
//! root. Both are provided by the host node; these traits pin down exactly
//! what the sync requires of them.

use ethereum_types::H256;
use thiserror::Error;

use crate::error::TrieError;
use crate::nibbles::{hex_to_compact, hex_to_keybytes};

/// A trie path split into its wire segments: one segment for an account-trie
/// node, or `[account key bytes, storage path]` for a storage-trie node. A
/// storage node is never addressed before its account path is fully expanded,
/// so two segments always start with a full-depth account key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncPath(pub Vec<Vec<u8>>);

impl SyncPath {
    /// Splits a raw nibble path into wire segments.
    pub fn from_hex(path: &[u8]) -> Self {
        if path.len() < 64 {
            SyncPath(vec![hex_to_compact(path)])
        } else {
            SyncPath(vec![hex_to_keybytes(&path[..64]), hex_to_compact(&path[64..])])
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Receiver for internal nodes emitted by a [`StackTrie`] as leaves below them
/// become final. Holds the destination batch and owner account internally.
pub trait TrieNodeSink: Send {
    fn write_node(&mut self, path: &[u8], hash: H256, node: &[u8]);
}

/// Streaming trie builder. Consumes leaves in ascending key order and emits
/// finished internal nodes to its sink; `commit` seals the remaining spine and
/// returns the root hash.
pub trait StackTrie: Send {
    fn update(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TrieError>;
    fn commit(&mut self) -> Result<H256, TrieError>;
}

pub trait StackTrieFactory: Send + Sync {
    fn build(&self, sink: Box<dyn TrieNodeSink>) -> Box<dyn StackTrie>;
}

/// Classification of a delivered node or bytecode by the scheduler.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("already processed")]
    AlreadyProcessed,
    #[error("not requested")]
    NotRequested,
    #[error("invalid entry: {0}")]
    Invalid(String),
}

/// Receiver for flat state (account or storage slot) recovered while healing.
/// One path element addresses an account, two address a storage slot.
pub trait HealLeafSink: Send {
    fn on_heal_state(&mut self, paths: &[Vec<u8>], value: &[u8]);
}

/// The trie-sync scheduler: tracks which trie nodes and bytecodes are still
/// missing below the target root, absorbs deliveries, and buffers finished
/// nodes until they are committed to the database.
pub trait TrieScheduler: Send {
    /// Up to `max` missing items: raw trie node paths with their expected
    /// hashes, plus missing bytecode hashes.
    fn missing(&mut self, max: usize) -> (Vec<Vec<u8>>, Vec<H256>, Vec<H256>);

    fn process_node(&mut self, path: &[u8], node: &[u8]) -> Result<(), SchedulerError>;

    fn process_code(&mut self, hash: H256, code: &[u8]) -> Result<(), SchedulerError>;

    /// Number of items still unresolved (queued or unrequested).
    fn pending(&self) -> usize;

    /// Bytes buffered and not yet committed.
    fn mem_size(&self) -> usize;

    /// Drains buffered nodes through `write` as raw key/value pairs.
    fn commit(&mut self, write: &mut dyn FnMut(&[u8], &[u8])) -> Result<(), TrieError>;
}

pub trait TrieSchedulerFactory: Send + Sync {
    /// Creates a scheduler rooted at `root`. Healed flat state is forwarded to
    /// `leaf_sink` as it is recovered.
    fn create(&self, root: H256, leaf_sink: Box<dyn HealLeafSink>) -> Box<dyn TrieScheduler>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_path_is_single_segment() {
        let path = vec![0x1, 0x2, 0x3];
        let sync_path = SyncPath::from_hex(&path);
        assert_eq!(sync_path.len(), 1);
        assert_eq!(sync_path.0[0], hex_to_compact(&path));
    }

    #[test]
    fn deep_path_splits_into_account_and_storage_segments() {
        let mut path = vec![0x0u8; 64];
        path[63] = 0x7;
        path.extend_from_slice(&[0x4, 0x5]);
        let sync_path = SyncPath::from_hex(&path);
        assert_eq!(sync_path.len(), 2);
        assert_eq!(sync_path.0[0].len(), 32);
        assert_eq!(sync_path.0[1], hex_to_compact(&[0x4, 0x5]));
    }
}

//! Key layout for the flat snapshot, contract code and reconstructed trie
//! nodes, plus the snapshot-sync checkpoint entry.

use ethereum_types::H256;
use vela_trie::TrieNodeSink;

use crate::{HookedBatch, KeyValueStore, KeyValueWriter, StoreError};

/// account hash -> slim account data
const SNAPSHOT_ACCOUNT_PREFIX: &[u8] = b"a";
/// account hash ++ slot hash -> slot value
const SNAPSHOT_STORAGE_PREFIX: &[u8] = b"o";
/// code hash -> contract code
const CODE_PREFIX: &[u8] = b"c";
/// path -> account trie node
const TRIE_NODE_ACCOUNT_PREFIX: &[u8] = b"A";
/// account hash ++ path -> storage trie node
const TRIE_NODE_STORAGE_PREFIX: &[u8] = b"O";
/// JSON-encoded snapshot sync progress checkpoint
const SNAPSHOT_SYNC_STATUS_KEY: &[u8] = b"SnapshotSyncStatus";

pub fn account_snapshot_key(account: H256) -> Vec<u8> {
    [SNAPSHOT_ACCOUNT_PREFIX, account.as_bytes()].concat()
}

pub fn storage_snapshot_key(account: H256, slot: H256) -> Vec<u8> {
    [SNAPSHOT_STORAGE_PREFIX, account.as_bytes(), slot.as_bytes()].concat()
}

pub fn code_key(hash: H256) -> Vec<u8> {
    [CODE_PREFIX, hash.as_bytes()].concat()
}

/// Trie nodes are routed by owner: the zero owner addresses the account trie,
/// anything else the storage trie of that account.
pub fn trie_node_key(owner: H256, path: &[u8]) -> Vec<u8> {
    if owner.is_zero() {
        [TRIE_NODE_ACCOUNT_PREFIX, path].concat()
    } else {
        [TRIE_NODE_STORAGE_PREFIX, owner.as_bytes(), path].concat()
    }
}

pub fn write_account_snapshot<W: KeyValueWriter>(writer: &W, account: H256, slim: &[u8]) {
    writer.put_kv(account_snapshot_key(account), slim.to_vec());
}

pub fn write_storage_snapshot<W: KeyValueWriter>(writer: &W, account: H256, slot: H256, value: &[u8]) {
    writer.put_kv(storage_snapshot_key(account, slot), value.to_vec());
}

pub fn write_code<W: KeyValueWriter>(writer: &W, hash: H256, code: &[u8]) {
    writer.put_kv(code_key(hash), code.to_vec());
}

pub fn write_trie_node<W: KeyValueWriter>(
    writer: &W,
    owner: H256,
    path: &[u8],
    _hash: H256,
    node: &[u8],
) {
    writer.put_kv(trie_node_key(owner, path), node.to_vec());
}

pub fn has_code(store: &dyn KeyValueStore, hash: H256) -> Result<bool, StoreError> {
    store.contains(&code_key(hash))
}

pub fn has_trie_node(store: &dyn KeyValueStore, owner: H256, path: &[u8]) -> Result<bool, StoreError> {
    store.contains(&trie_node_key(owner, path))
}

pub fn read_account_snapshot(
    store: &dyn KeyValueStore,
    account: H256,
) -> Result<Option<Vec<u8>>, StoreError> {
    store.get(&account_snapshot_key(account))
}

pub fn read_snapshot_sync_status(store: &dyn KeyValueStore) -> Result<Option<Vec<u8>>, StoreError> {
    store.get(SNAPSHOT_SYNC_STATUS_KEY)
}

pub fn write_snapshot_sync_status(store: &dyn KeyValueStore, status: &[u8]) -> Result<(), StoreError> {
    store.put(SNAPSHOT_SYNC_STATUS_KEY, status)
}

pub fn delete_snapshot_sync_status(store: &dyn KeyValueStore) -> Result<(), StoreError> {
    store.delete(SNAPSHOT_SYNC_STATUS_KEY)
}

/// Prefix under which all account snapshot entries live; used by tests and
/// tooling to enumerate the snapshot.
pub fn account_snapshot_prefix() -> &'static [u8] {
    SNAPSHOT_ACCOUNT_PREFIX
}

pub fn storage_snapshot_prefix() -> &'static [u8] {
    SNAPSHOT_STORAGE_PREFIX
}

/// Routes stack-trie output into a batch under a fixed owner. This is the
/// writer object the sync hands to every trie builder it creates.
pub struct BatchNodeSink {
    batch: HookedBatch,
    owner: H256,
}

impl BatchNodeSink {
    pub fn new(batch: HookedBatch, owner: H256) -> Self {
        Self { batch, owner }
    }
}

impl TrieNodeSink for BatchNodeSink {
    fn write_node(&mut self, path: &[u8], hash: H256, node: &[u8]) {
        write_trie_node(&self.batch, self.owner, path, hash, node);
    }
}

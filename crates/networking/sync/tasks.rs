//! Task bookkeeping for the snapshot download: the per-interval account and
//! storage tasks, heal tasks, and the containers they move through while a
//! request is pending, in flight, being integrated, or awaiting retry.

use std::collections::{BTreeMap, BTreeSet};

use ethereum_types::H256;
use rand::Rng;
use serde::{Deserialize, Serialize};
use vela_common::types::AccountState;
use vela_storage::HookedBatch;
use vela_trie::StackTrie;

use crate::heal_paths::TrieNodePathSet;

/// Sync task for one contiguous interval of the account snapshot.
///
/// `next`, `last` and `sub_tasks` survive restarts through the serialized
/// checkpoint; everything else is in-flight bookkeeping rebuilt on load.
#[derive(Default, Serialize, Deserialize)]
pub struct AccountTask {
    #[serde(skip)]
    pub id: u64,

    /// Next account to sync in this interval.
    pub next: H256,
    /// Last account to sync in this interval.
    pub last: H256,
    /// Storage intervals still needing fetching for large contracts.
    pub sub_tasks: BTreeMap<H256, Vec<StorageTask>>,

    /// Number of pending sub-obligations (code or storage) for this round.
    #[serde(skip)]
    pub pend: usize,

    /// Whether the accounts of the current response need code retrieval.
    #[serde(skip)]
    pub need_code: Vec<bool>,
    /// Whether the accounts of the current response need storage retrieval.
    #[serde(skip)]
    pub need_state: Vec<bool>,
    /// Whether the accounts of the current response were chunked and need
    /// healing.
    #[serde(skip)]
    pub need_heal: Vec<bool>,

    /// Code hashes that still need retrieval.
    #[serde(skip)]
    pub code_tasks: BTreeSet<H256>,
    /// Account hash -> storage root of small storages still to fetch whole.
    #[serde(skip)]
    pub state_tasks: BTreeMap<H256, H256>,

    /// Write-through batch absorbing generated account trie nodes.
    #[serde(skip)]
    pub gen_batch: HookedBatch,
    /// Node generator fed from persisted accounts.
    #[serde(skip)]
    pub gen_trie: Option<Box<dyn StackTrie>>,

    #[serde(skip)]
    pub requested: bool,
    #[serde(skip)]
    pub done: bool,

    /// Last integrated account-range response, pending forward.
    #[serde(skip)]
    pub res: Option<AccountResponse>,
}

impl AccountTask {
    /// A task may leave the registry only once its interval is complete and
    /// nothing still references its response.
    pub fn removable(&self) -> bool {
        self.done && self.pend == 0 && self.res.is_none()
    }
}

/// An already verified response to an account range request: the sub-trie for
/// the requested interval, expanded.
pub struct AccountResponse {
    pub hashes: Vec<H256>,
    pub accounts: Vec<AccountState>,
    /// Whether the account range has a continuation.
    pub cont: bool,
}

/// Sync task for a chunk of one large contract's storage snapshot.
#[derive(Default, Serialize, Deserialize)]
pub struct StorageTask {
    /// Next slot to sync in this interval.
    pub next: H256,
    /// Last slot to sync in this interval.
    pub last: H256,
    /// Storage root for this retrieval; refreshed by every account response
    /// that resumes the contract.
    #[serde(skip)]
    pub root: H256,
    #[serde(skip)]
    pub gen_batch: HookedBatch,
    #[serde(skip)]
    pub gen_trie: Option<Box<dyn StackTrie>>,
    #[serde(skip)]
    pub requested: bool,
    #[serde(skip)]
    pub done: bool,
}

/// Identifies one in-flight large-contract chunk: the chunk intervals of an
/// account are disjoint, so the interval end pins the chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubTaskRef {
    pub account: H256,
    pub last: H256,
}

/// A single wire request spanning the storage of up to K accounts, or one
/// chunk of a single large contract.
pub struct StorageTaskBundle {
    pub id: u64,
    /// The account task this bundle was carved out of.
    pub task_id: u64,
    pub accounts: Vec<H256>,
    pub roots: Vec<H256>,
    pub subtask: Option<SubTaskRef>,
    pub origin: H256,
    pub limit: H256,
    /// Byte budget for the response.
    pub cap: usize,
}

/// Heal work in flight: either a set of trie-node requests or a set of
/// bytecode requests, never both.
pub struct HealTask {
    pub id: u64,
    /// Trie node paths queued in this request, with their expected hashes.
    pub trie_tasks: BTreeMap<Vec<u8>, H256>,
    /// Bytecode hashes queued in this request.
    pub code_tasks: BTreeSet<H256>,
    /// Request paths in dispatch (sorted) order.
    pub paths: Vec<Vec<u8>>,
    pub hashes: Vec<H256>,
    pub pathsets: Vec<TrieNodePathSet>,
    pub root: H256,
    pub bytecode_req: bool,
}

/// Missing heal work not yet carved into a request. Refilled from the trie
/// scheduler on demand.
#[derive(Default)]
pub struct HealPool {
    pub trie_tasks: BTreeMap<Vec<u8>, H256>,
    pub code_tasks: BTreeSet<H256>,
}

/// One of the four isomorphic task containers. A task lives in exactly one of
/// {tasks, requesting, retries} at any time and passes through `processing`
/// while its response is integrated; moving the owned value between
/// containers is what enforces that.
#[derive(Default)]
pub struct TaskSet {
    pub account_tasks: BTreeMap<u64, AccountTask>,
    pub storage_tasks: BTreeMap<u64, StorageTaskBundle>,
    /// Code hash -> account task that wants it.
    pub code_tasks: BTreeMap<H256, u64>,
    pub healer: BTreeMap<u64, HealTask>,
    /// Range phase complete; the registry is in heal phase. Only meaningful on
    /// the pending container.
    pub snapped: bool,
}

impl TaskSet {
    pub fn is_empty(&self) -> bool {
        self.account_tasks.is_empty()
            && self.storage_tasks.is_empty()
            && self.code_tasks.is_empty()
            && self.healer.is_empty()
    }
}

/// Draws a fresh 63-bit non-zero id, retrying on collision.
pub(crate) fn generate_id<F: FnMut(u64) -> bool>(mut in_use: F) -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let id = rng.gen::<u64>() >> 1;
        if id != 0 && !in_use(id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_nonzero() {
        let mut seen = BTreeSet::new();
        for _ in 0..1000 {
            let id = generate_id(|id| seen.contains(&id));
            assert_ne!(id, 0);
            assert!(id < (1u64 << 63));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn generate_id_redraws_on_collision() {
        let mut draws = 0;
        let id = generate_id(|_| {
            draws += 1;
            draws <= 3
        });
        assert_eq!(draws, 4, "first three draws were reported in use");
        assert_ne!(id, 0);
    }

    #[test]
    fn removable_requires_done_without_references() {
        let mut task = AccountTask::default();
        assert!(!task.removable());
        task.done = true;
        assert!(task.removable());
        task.pend = 1;
        assert!(!task.removable());
        task.pend = 0;
        task.res = Some(AccountResponse {
            hashes: vec![],
            accounts: vec![],
            cont: false,
        });
        assert!(!task.removable());
    }

    #[test]
    fn task_set_emptiness_tracks_all_buckets() {
        let mut set = TaskSet::default();
        assert!(set.is_empty());
        set.code_tasks.insert(H256::zero(), 1);
        assert!(!set.is_empty());
        set.code_tasks.remove(&H256::zero());
        assert!(set.is_empty());
    }
}

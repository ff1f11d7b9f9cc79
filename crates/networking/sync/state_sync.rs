//! The state download manager: owns the task registry, carves requests out of
//! it, integrates verified responses into partially-built tries, persists the
//! flat snapshot, and checkpoints its progress so an aborted sync resumes
//! where it left off.

mod dispatch;
mod process;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use vela_common::types::{slim_account_rlp, AccountState};
use vela_rlp::decode::RLPDecode;
use vela_rlp::encode::RLPEncode;
use vela_storage::{
    keys, BatchNodeSink, HookedBatch, KeyValueStore, SizeCounter, WriteBatch, IDEAL_BATCH_SIZE,
};
use vela_trie::{HealLeafSink, StackTrieFactory, TrieScheduler, TrieSchedulerFactory};

use crate::constants::MIN_TRIENODE_HEAL_THROTTLE;
use crate::range::{inc_hash, partition_account_ranges};
use crate::tasks::{AccountTask, HealPool, TaskSet};
use crate::SyncError;

/// Serialized checkpoint: the remaining account tasks (contract sub-tasks
/// within) plus the running counters. Stored as JSON under the snapshot sync
/// status key; the numeric task ids become stringified JSON object keys.
#[derive(Deserialize)]
pub(crate) struct SyncProgress {
    #[serde(default)]
    pub tasks: BTreeMap<u64, AccountTask>,
    #[serde(default)]
    pub account_synced: u64,
    #[serde(default)]
    pub account_bytes: u64,
    #[serde(default)]
    pub bytecode_synced: u64,
    #[serde(default)]
    pub bytecode_bytes: u64,
    #[serde(default)]
    pub storage_synced: u64,
    #[serde(default)]
    pub storage_bytes: u64,
    #[serde(default)]
    pub trienode_heal_synced: u64,
    #[serde(default)]
    pub trienode_heal_bytes: u64,
    #[serde(default)]
    pub bytecode_heal_synced: u64,
    #[serde(default)]
    pub bytecode_heal_bytes: u64,
}

#[derive(Serialize)]
struct SyncProgressRef<'a> {
    tasks: BTreeMap<u64, &'a AccountTask>,
    account_synced: u64,
    account_bytes: u64,
    bytecode_synced: u64,
    bytecode_bytes: u64,
    storage_synced: u64,
    storage_bytes: u64,
    trienode_heal_synced: u64,
    trienode_heal_bytes: u64,
    bytecode_heal_synced: u64,
    bytecode_heal_bytes: u64,
}

/// Snapshot of the sync counters, for progress logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub account_synced: u64,
    pub account_bytes: u64,
    pub bytecode_synced: u64,
    pub bytecode_bytes: u64,
    pub storage_synced: u64,
    pub storage_bytes: u64,
    pub trienode_heal_synced: u64,
    pub trienode_heal_bytes: u64,
    pub bytecode_heal_synced: u64,
    pub bytecode_heal_bytes: u64,
}

pub(crate) struct Inner {
    pub root: H256,
    pub scheduler: Option<Box<dyn TrieScheduler>>,

    /// Pending work pool. Owns every live account task that is not in flight.
    pub tasks: TaskSet,
    /// Work dispatched to a peer and awaiting a response.
    pub requesting: TaskSet,
    /// Work whose response is being integrated right now.
    pub processing: TaskSet,
    /// Work whose dispatch failed, served again before anything else.
    pub retries: TaskSet,

    /// Missing heal work not yet carved into a request.
    pub heal_pool: HealPool,

    /// Shared batch for raw states recovered while healing.
    pub state_writer: WriteBatch,

    pub completed: bool,

    pub account_synced: u64,
    pub bytecode_synced: u64,
    pub bytecode_bytes: u64,
    pub storage_synced: u64,
    pub trienode_heal_synced: u64,
    pub trienode_heal_bytes: u64,
    pub trienode_heal_dups: u64,
    pub trienode_heal_nops: u64,
    pub bytecode_heal_synced: u64,
    pub bytecode_heal_bytes: u64,
    pub bytecode_heal_dups: u64,
    pub bytecode_heal_nops: u64,

    /// Smoothed processing rate of healed trie nodes.
    pub trienode_heal_rate: f64,
    /// Divisor applied to the heal request capacity.
    pub trienode_heal_throttle: f64,
    /// Last time the throttle was adjusted.
    pub trienode_heal_throttled: Instant,
}

impl Inner {
    /// No account interval is live anywhere: not pending, not in flight, not
    /// failed-awaiting-retry, not mid-integration.
    pub(crate) fn no_account_tasks_left(&self) -> bool {
        self.tasks.account_tasks.is_empty()
            && self.requesting.account_tasks.is_empty()
            && self.retries.account_tasks.is_empty()
            && self.processing.account_tasks.is_empty()
    }

    fn new() -> Self {
        Self {
            root: H256::zero(),
            scheduler: None,
            tasks: TaskSet::default(),
            requesting: TaskSet::default(),
            processing: TaskSet::default(),
            retries: TaskSet::default(),
            heal_pool: HealPool::default(),
            state_writer: WriteBatch::new(),
            completed: false,
            account_synced: 0,
            bytecode_synced: 0,
            bytecode_bytes: 0,
            storage_synced: 0,
            trienode_heal_synced: 0,
            trienode_heal_bytes: 0,
            trienode_heal_dups: 0,
            trienode_heal_nops: 0,
            bytecode_heal_synced: 0,
            bytecode_heal_bytes: 0,
            bytecode_heal_dups: 0,
            bytecode_heal_nops: 0,
            trienode_heal_rate: 0.0,
            trienode_heal_throttle: MIN_TRIENODE_HEAL_THROTTLE,
            trienode_heal_throttled: Instant::now(),
        }
    }
}

/// Single-writer manager for the snapshot state download of one shard. All
/// registry and counter mutation happens under one lock, taken exclusively in
/// every handler and in `next_batch`; nothing suspends while it is held.
pub struct StateDownloader {
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) stack_tries: Arc<dyn StackTrieFactory>,
    schedulers: Arc<dyn TrieSchedulerFactory>,
    /// Number of intervals the account space is split into.
    concurrency: u64,

    pub(crate) inner: Mutex<Inner>,

    /// Trie nodes requested for healing and not yet integrated.
    pub(crate) trienode_heal_pend: AtomicU64,

    /// Byte counters fed by batch on-put hooks. Only bumped under the lock.
    pub(crate) account_bytes: SizeCounter,
    pub(crate) storage_bytes: SizeCounter,
    pub(crate) account_healed: SizeCounter,
    pub(crate) account_healed_bytes: SizeCounter,
    pub(crate) storage_healed: SizeCounter,
    pub(crate) storage_healed_bytes: SizeCounter,
}

impl StateDownloader {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        stack_tries: Arc<dyn StackTrieFactory>,
        schedulers: Arc<dyn TrieSchedulerFactory>,
        concurrency: u64,
    ) -> Self {
        Self {
            store,
            stack_tries,
            schedulers,
            concurrency: concurrency.max(1),
            inner: Mutex::new(Inner::new()),
            trienode_heal_pend: AtomicU64::new(0),
            account_bytes: SizeCounter::new(),
            storage_bytes: SizeCounter::new(),
            account_healed: SizeCounter::new(),
            account_healed_bytes: SizeCounter::new(),
            storage_healed: SizeCounter::new(),
            storage_healed_bytes: SizeCounter::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Installs the target root, constructs the trie-sync scheduler and loads
    /// any previous checkpoint.
    pub fn set_root_hash(&self, root: H256) -> Result<(), SyncError> {
        let mut inner = self.lock();
        inner.root = root;
        inner.completed = false;
        let writer = HealStateWriter {
            store: Arc::clone(&self.store),
            batch: inner.state_writer.clone(),
            account_healed: self.account_healed.clone(),
            account_healed_bytes: self.account_healed_bytes.clone(),
            storage_healed: self.storage_healed.clone(),
            storage_healed_bytes: self.storage_healed_bytes.clone(),
        };
        inner.scheduler = Some(self.schedulers.create(root, Box::new(writer)));
        self.load_sync_status(&mut inner)
    }

    pub fn root(&self) -> H256 {
        self.lock().root
    }

    /// Range phase complete, the registry is in heal phase.
    pub fn is_snapped(&self) -> bool {
        self.lock().tasks.snapped
    }

    /// The whole cycle is done: ranges fetched, heal drained, progress saved.
    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    pub fn report(&self) -> SyncReport {
        let inner = self.lock();
        SyncReport {
            account_synced: inner.account_synced,
            account_bytes: self.account_bytes.get(),
            bytecode_synced: inner.bytecode_synced,
            bytecode_bytes: inner.bytecode_bytes,
            storage_synced: inner.storage_synced,
            storage_bytes: self.storage_bytes.get(),
            trienode_heal_synced: inner.trienode_heal_synced,
            trienode_heal_bytes: inner.trienode_heal_bytes,
            bytecode_heal_synced: inner.bytecode_heal_synced,
            bytecode_heal_bytes: inner.bytecode_heal_bytes,
        }
    }

    /// Persists the current progress markers. Called on completion and safe to
    /// call at any shutdown point.
    pub fn checkpoint(&self) -> Result<(), SyncError> {
        let mut inner = self.lock();
        self.save_sync_status(&mut inner)
    }

    fn build_account_trie(&self, batch: &HookedBatch) -> Box<dyn vela_trie::StackTrie> {
        self.stack_tries
            .build(Box::new(BatchNodeSink::new(batch.clone(), H256::zero())))
    }

    pub(crate) fn build_storage_trie(
        &self,
        batch: &HookedBatch,
        account: H256,
    ) -> Box<dyn vela_trie::StackTrie> {
        self.stack_tries
            .build(Box::new(BatchNodeSink::new(batch.clone(), account)))
    }

    /// Retrieves a previously aborted sync status, or chunks up the account
    /// range into fresh retrieval tasks if there is none.
    fn load_sync_status(&self, inner: &mut Inner) -> Result<(), SyncError> {
        if let Some(status) = keys::read_snapshot_sync_status(&*self.store)? {
            match serde_json::from_slice::<SyncProgress>(&status) {
                Ok(progress) => {
                    let mut tasks = progress.tasks;
                    for (id, task) in tasks.iter_mut() {
                        task.id = *id;
                        task.gen_batch = HookedBatch::new(self.account_bytes.clone());
                        task.gen_trie = Some(self.build_account_trie(&task.gen_batch));
                        for (account, subtasks) in task.sub_tasks.iter_mut() {
                            for subtask in subtasks.iter_mut() {
                                subtask.gen_batch = HookedBatch::new(self.storage_bytes.clone());
                                subtask.gen_trie =
                                    Some(self.build_storage_trie(&subtask.gen_batch, *account));
                            }
                        }
                        debug!(from = ?task.next, last = ?task.last, "Scheduled account sync task");
                    }
                    inner.tasks.snapped = tasks.is_empty();
                    inner.tasks.account_tasks = tasks;

                    inner.account_synced = progress.account_synced;
                    self.account_bytes.set(progress.account_bytes);
                    inner.bytecode_synced = progress.bytecode_synced;
                    inner.bytecode_bytes = progress.bytecode_bytes;
                    inner.storage_synced = progress.storage_synced;
                    self.storage_bytes.set(progress.storage_bytes);
                    inner.trienode_heal_synced = progress.trienode_heal_synced;
                    inner.trienode_heal_bytes = progress.trienode_heal_bytes;
                    inner.bytecode_heal_synced = progress.bytecode_heal_synced;
                    inner.bytecode_heal_bytes = progress.bytecode_heal_bytes;
                    return Ok(());
                }
                Err(err) => error!(%err, "Failed to decode snap sync status"),
            }
        }

        // Either decoding failed or there was no previous state: start fresh.
        inner.account_synced = 0;
        self.account_bytes.set(0);
        inner.bytecode_synced = 0;
        inner.bytecode_bytes = 0;
        inner.storage_synced = 0;
        self.storage_bytes.set(0);
        inner.trienode_heal_synced = 0;
        inner.trienode_heal_bytes = 0;
        inner.bytecode_heal_synced = 0;
        inner.bytecode_heal_bytes = 0;

        inner.tasks.account_tasks.clear();
        inner.tasks.snapped = false;
        for (next, last) in partition_account_ranges(self.concurrency) {
            let id = crate::tasks::generate_id(|id| inner.tasks.account_tasks.contains_key(&id));
            let gen_batch = HookedBatch::new(self.account_bytes.clone());
            let gen_trie = Some(self.build_account_trie(&gen_batch));
            inner.tasks.account_tasks.insert(
                id,
                AccountTask {
                    id,
                    next,
                    last,
                    gen_batch,
                    gen_trie,
                    ..AccountTask::default()
                },
            );
            debug!(from = ?next, last = ?last, "Created account sync task");
        }
        Ok(())
    }

    /// Marshals the remaining sync tasks and counters into the store. Tasks
    /// are gathered from every container so in-flight intervals survive a
    /// shutdown too.
    pub(crate) fn save_sync_status(&self, inner: &mut Inner) -> Result<(), SyncError> {
        let mut tasks: BTreeMap<u64, &AccountTask> = BTreeMap::new();
        for container in [
            &inner.tasks,
            &inner.requesting,
            &inner.retries,
            &inner.processing,
        ] {
            for (id, task) in &container.account_tasks {
                tasks.insert(*id, task);
            }
        }
        // Serialize any partial progress to disk before spinning down
        for task in tasks.values() {
            if let Err(err) = task.gen_batch.write_to(&*self.store) {
                debug!(%err, "Failed to persist account slots");
            }
            for subtasks in task.sub_tasks.values() {
                for subtask in subtasks {
                    if let Err(err) = subtask.gen_batch.write_to(&*self.store) {
                        debug!(%err, "Failed to persist storage slots");
                    }
                }
            }
        }
        let progress = SyncProgressRef {
            tasks,
            account_synced: inner.account_synced,
            account_bytes: self.account_bytes.get(),
            bytecode_synced: inner.bytecode_synced,
            bytecode_bytes: inner.bytecode_bytes,
            storage_synced: inner.storage_synced,
            storage_bytes: self.storage_bytes.get(),
            trienode_heal_synced: inner.trienode_heal_synced,
            trienode_heal_bytes: inner.trienode_heal_bytes,
            bytecode_heal_synced: inner.bytecode_heal_synced,
            bytecode_heal_bytes: inner.bytecode_heal_bytes,
        };
        // This can only fail on a logic error in the task types themselves
        let status =
            serde_json::to_vec(&progress).expect("sync progress serialization cannot fail");
        keys::write_snapshot_sync_status(&*self.store, &status)?;
        Ok(())
    }

    /// Removes account range retrieval tasks that have completed, flipping the
    /// registry into heal phase once the last one is gone.
    pub(crate) fn clean_account_tasks(&self, inner: &mut Inner) {
        // If the range phase finished before, don't even bother
        if inner.tasks.snapped {
            return;
        }
        inner.tasks.account_tasks.retain(|_, task| !task.removable());
        if inner.no_account_tasks_left() {
            inner.tasks.snapped = true;
            debug!("Account range phase complete, moving to heal");
        }
    }

    /// Sweeps finished storage sub-tasks, completing their owning accounts
    /// once every chunk of a contract is done.
    pub(crate) fn clean_storage_tasks(&self, inner: &mut Inner) -> Result<(), SyncError> {
        let ids: Vec<u64> = inner.tasks.account_tasks.keys().copied().collect();
        for id in ids {
            let Some(mut task) = inner.tasks.account_tasks.remove(&id) else {
                continue;
            };
            let mut finished: Vec<H256> = Vec::new();
            for (account, subtasks) in task.sub_tasks.iter_mut() {
                subtasks.retain(|subtask| !subtask.done);
                if subtasks.is_empty() {
                    finished.push(*account);
                }
            }
            for account in &finished {
                task.sub_tasks.remove(account);
                let matches: Vec<usize> = task
                    .res
                    .as_ref()
                    .map(|res| {
                        res.hashes
                            .iter()
                            .enumerate()
                            .filter(|(_, hash)| *hash == account)
                            .map(|(j, _)| j)
                            .collect()
                    })
                    .unwrap_or_default();
                for j in matches {
                    task.need_state[j] = false;
                }
                task.pend = task.pend.saturating_sub(1);
            }
            if !finished.is_empty() && task.pend == 0 {
                self.forward_account_task(inner, &mut task)?;
            }
            inner.tasks.account_tasks.insert(id, task);
        }
        Ok(())
    }

    /// Takes a filled account task, persists everything available and pushes
    /// the interval cursor forward to the first account still missing data.
    pub(crate) fn forward_account_task(
        &self,
        inner: &mut Inner,
        task: &mut AccountTask,
    ) -> Result<(), SyncError> {
        let Some(res) = task.res.take() else {
            return Ok(()); // nothing to forward
        };

        // Persist the received account segments. The flat state may be
        // outdated by now, but the heal phase fixes that up later.
        let old_account_bytes = self.account_bytes.get();
        let batch = HookedBatch::new(self.account_bytes.clone());
        let mut all_clean = true;
        for (i, hash) in res.hashes.iter().enumerate() {
            if task.need_code[i] || task.need_state[i] {
                all_clean = false;
                break;
            }
            let slim = slim_account_rlp(&res.accounts[i]);
            keys::write_account_snapshot(&batch, *hash, &slim);

            // Complete accounts feed the stack trie; chunked ones are left for
            // the heal phase so the gluing nodes aren't clobbered.
            if !task.need_heal[i] {
                if let Some(trie) = task.gen_trie.as_mut() {
                    trie.update(hash.as_bytes(), res.accounts[i].encode_to_vec())?;
                }
            }
            task.next = inc_hash(*hash);
        }
        batch.write_to(&*self.store)?;
        inner.account_synced += res.accounts.len() as u64;

        if all_clean {
            task.done = !res.cont;
        }
        task.requested = false;

        // The stack trie may only be sealed once the interval is complete;
        // losing the write on a crash merely means more heal traffic.
        if task.done {
            if let Some(trie) = task.gen_trie.as_mut() {
                trie.commit()?;
            }
        }
        if task.gen_batch.value_size() > IDEAL_BATCH_SIZE || task.done {
            task.gen_batch.write_to(&*self.store)?;
            task.gen_batch.reset();
        }
        debug!(
            accounts = res.accounts.len(),
            bytes = self.account_bytes.get() - old_account_bytes,
            "Persisted range of accounts"
        );
        Ok(())
    }

    /// Flushes the scheduler's buffered heal data once it outgrows a batch (or
    /// unconditionally when forced).
    pub(crate) fn commit_healer(&self, inner: &mut Inner, force: bool) -> Result<(), SyncError> {
        let Some(scheduler) = inner.scheduler.as_mut() else {
            return Ok(());
        };
        if !force && scheduler.mem_size() < IDEAL_BATCH_SIZE {
            return Ok(());
        }
        let batch = WriteBatch::new();
        if let Err(err) = scheduler.commit(&mut |key, value| {
            batch.put(key.to_vec(), value.to_vec());
        }) {
            error!(%err, "Failed to commit healing data");
        }
        let bytes = batch.value_size();
        batch.write_to(&*self.store)?;
        debug!(bytes, "Persisted set of healing data");
        Ok(())
    }

    /// Final flush: seals all trie builders, drains the heal buffers and the
    /// shared state writer, and persists the last progress markers.
    pub(crate) fn sync_completed(&self, inner: &mut Inner) -> Result<(), SyncError> {
        self.commit_healer(inner, true)?;

        if inner.state_writer.value_size() > 0 {
            inner.state_writer.write_to(&*self.store)?;
            inner.state_writer.reset();
        }

        // Persist any progress, independent of what remains
        let ids: Vec<u64> = inner.tasks.account_tasks.keys().copied().collect();
        for id in ids {
            if let Some(mut task) = inner.tasks.account_tasks.remove(&id) {
                self.forward_account_task(inner, &mut task)?;
                inner.tasks.account_tasks.insert(id, task);
            }
        }
        self.clean_account_tasks(inner);
        self.save_sync_status(inner)?;

        inner.completed = true;
        debug!(root = ?inner.root, "Terminating snapshot sync cycle");
        Ok(())
    }
}

/// Callback target for flat state recovered during healing. Healed entries are
/// persisted blindly through the shared state writer; they get fixed up by
/// snapshot generation later.
struct HealStateWriter {
    store: Arc<dyn KeyValueStore>,
    batch: WriteBatch,
    account_healed: SizeCounter,
    account_healed_bytes: SizeCounter,
    storage_healed: SizeCounter,
    storage_healed_bytes: SizeCounter,
}

impl HealLeafSink for HealStateWriter {
    fn on_heal_state(&mut self, paths: &[Vec<u8>], value: &[u8]) {
        if paths.len() == 1 && paths[0].len() == 32 {
            let Ok(account) = AccountState::decode(value) else {
                return; // surfacing this would drop the remote peer
            };
            let slim = slim_account_rlp(&account);
            keys::write_account_snapshot(&self.batch, H256::from_slice(&paths[0]), &slim);
            self.account_healed.add(1);
            self.account_healed_bytes.add((1 + 32 + slim.len()) as u64);
        }
        if paths.len() == 2 && paths[0].len() == 32 && paths[1].len() == 32 {
            keys::write_storage_snapshot(
                &self.batch,
                H256::from_slice(&paths[0]),
                H256::from_slice(&paths[1]),
                value,
            );
            self.storage_healed.add(1);
            self.storage_healed_bytes.add((1 + 64 + value.len()) as u64);
        }
        if self.batch.value_size() > IDEAL_BATCH_SIZE {
            if let Err(err) = self.batch.write_to(&*self.store) {
                warn!(%err, "Failed to persist healed states");
            }
            self.batch.reset();
        }
    }
}

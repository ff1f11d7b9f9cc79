//! Request assembly: carving up to `STATES_PER_REQUEST` work items out of the
//! registry per round, serving retries before fresh work, and routing failed
//! dispatches back into the retry container.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use ethereum_types::H256;
use tracing::debug;
use vela_common::constants::MAX_HASH;

use crate::constants::{
    MAX_CODE_REQUEST_COUNT, MAX_REQUEST_SIZE, MAX_TRIE_REQUEST_COUNT, MIN_REQUEST_SIZE,
    STATES_PER_REQUEST,
};
use crate::heal_paths::sort_by_account_path;
use crate::requests::{
    AccountRangeRequest, BytecodeHealRequest, BytecodeRequest, DispatchBatch, FailedRequest,
    StorageRangeRequest, TrienodeHealRequest,
};
use crate::tasks::{generate_id, HealTask, StorageTaskBundle, SubTaskRef};
use crate::SyncError;

use super::{Inner, StateDownloader};

impl StateDownloader {
    /// Produces the next batch of requests to dispatch, preferring retries
    /// over unprocessed work. Each non-empty slot of the result is one
    /// independent request. Once every task is gone and the scheduler reports
    /// nothing pending, the final flush runs and the batch comes back empty.
    pub fn next_batch(&self) -> Result<DispatchBatch, SyncError> {
        let mut inner = self.lock();

        self.clean_storage_tasks(&mut inner)?;
        self.clean_account_tasks(&mut inner);

        let cap = STATES_PER_REQUEST;
        let mut batch = self.batch_from_retries(&mut inner, cap);
        let gathered = batch.len();
        if gathered >= cap {
            return Ok(batch);
        }

        let pending = inner.scheduler.as_ref().map_or(0, |s| s.pending());
        if inner.no_account_tasks_left() && pending == 0 {
            if gathered == 0 && !inner.completed {
                self.sync_completed(&mut inner)?;
            }
            return Ok(batch);
        }

        let with_heal = batch.healtask.is_none() && batch.codetask.is_none();
        self.batch_from_unprocessed(&mut inner, cap - gathered, with_heal, &mut batch);
        Ok(batch)
    }

    /// Re-issues previously failed requests. Heal retries are only served once
    /// no range work is waiting.
    fn batch_from_retries(&self, inner: &mut Inner, n: usize) -> DispatchBatch {
        let mut batch = DispatchBatch::default();
        let root = inner.root;

        let ids: Vec<u64> = inner.retries.account_tasks.keys().copied().take(n).collect();
        for id in ids {
            if let Some(task) = inner.retries.account_tasks.remove(&id) {
                batch.accounts.push(AccountRangeRequest {
                    task_id: id,
                    root,
                    origin: task.next,
                    limit: task.last,
                    cap: MAX_REQUEST_SIZE,
                });
                inner.requesting.account_tasks.insert(id, task);
            }
        }

        let cap = n.saturating_sub(batch.accounts.len());
        if cap > 0 {
            if let Some((_, &owner)) = inner.retries.code_tasks.iter().next() {
                let hashes: Vec<H256> = inner
                    .retries
                    .code_tasks
                    .iter()
                    .filter(|(_, task_id)| **task_id == owner)
                    .map(|(hash, _)| *hash)
                    .take(cap)
                    .collect();
                for hash in &hashes {
                    inner.retries.code_tasks.remove(hash);
                    inner.requesting.code_tasks.insert(*hash, owner);
                }
                batch.codes = Some(BytecodeRequest {
                    task_id: owner,
                    hashes,
                });
            }
        }

        if let Some(id) = inner.retries.storage_tasks.keys().next().copied() {
            if let Some(bundle) = inner.retries.storage_tasks.remove(&id) {
                batch.storages = Some(storage_request(&bundle, root));
                inner.requesting.storage_tasks.insert(id, bundle);
            }
        }

        if !batch.is_empty() {
            return batch;
        }

        // No range work failed; serve heal retries, one of each kind.
        let mut trienode_id = None;
        let mut bytecode_id = None;
        for (&id, task) in inner.retries.healer.iter() {
            if trienode_id.is_none() && !task.bytecode_req {
                trienode_id = Some(id);
            }
            if bytecode_id.is_none() && task.bytecode_req {
                bytecode_id = Some(id);
            }
            if trienode_id.is_some() && bytecode_id.is_some() {
                break;
            }
        }
        if let Some(id) = trienode_id {
            if let Some(task) = inner.retries.healer.remove(&id) {
                batch.healtask = Some(TrienodeHealRequest {
                    task_id: id,
                    root: task.root,
                    paths: task.paths.clone(),
                    hashes: task.hashes.clone(),
                    pathsets: task.pathsets.clone(),
                });
                self.trienode_heal_pend
                    .fetch_add(task.paths.len() as u64, Ordering::Relaxed);
                inner.requesting.healer.insert(id, task);
            }
        }
        if let Some(id) = bytecode_id {
            if let Some(task) = inner.retries.healer.remove(&id) {
                batch.codetask = Some(BytecodeHealRequest {
                    task_id: id,
                    hashes: task.hashes.clone(),
                });
                inner.requesting.healer.insert(id, task);
            }
        }
        batch
    }

    /// Fills the remaining capacity from unprocessed work: account intervals
    /// first, then bytecodes, then a single storage bundle, and finally heal
    /// tasks once the registry is snapped and nothing else was gathered.
    fn batch_from_unprocessed(
        &self,
        inner: &mut Inner,
        cap: usize,
        with_heal: bool,
        batch: &mut DispatchBatch,
    ) {
        let root = inner.root;
        let len_at_entry = batch.len();

        // 1. un-requested account intervals
        let ids: Vec<u64> = inner
            .tasks
            .account_tasks
            .iter()
            .filter(|(_, task)| !task.requested && task.id != 0)
            .map(|(id, _)| *id)
            .take(cap)
            .collect();
        let new_accounts = ids.len();
        for id in ids {
            if let Some(mut task) = inner.tasks.account_tasks.remove(&id) {
                task.requested = true;
                batch.accounts.push(AccountRangeRequest {
                    task_id: id,
                    root,
                    origin: task.next,
                    limit: task.last,
                    cap: MAX_REQUEST_SIZE,
                });
                inner.requesting.account_tasks.insert(id, task);
            }
        }
        let mut remaining = cap.saturating_sub(new_accounts);

        // 2. bytecodes, drained from the first task that wants any
        if remaining > 0 && batch.codes.is_none() {
            let owner = inner
                .tasks
                .account_tasks
                .iter()
                .find(|(_, task)| !task.code_tasks.is_empty())
                .map(|(id, _)| *id);
            if let Some(owner) = owner {
                let mut hashes = Vec::new();
                if let Some(task) = inner.tasks.account_tasks.get_mut(&owner) {
                    hashes = task.code_tasks.iter().copied().take(remaining).collect();
                    for hash in &hashes {
                        task.code_tasks.remove(hash);
                    }
                }
                for hash in &hashes {
                    inner.requesting.code_tasks.insert(*hash, owner);
                }
                remaining = remaining.saturating_sub(hashes.len());
                batch.codes = Some(BytecodeRequest {
                    task_id: owner,
                    hashes,
                });
            }
        }

        // 3. a single storage bundle
        if remaining > 0 && batch.storages.is_none() {
            let byte_cap = remaining.clamp(MIN_REQUEST_SIZE, MAX_REQUEST_SIZE);
            let storage_sets = byte_cap / 1024;
            let task_ids: Vec<u64> = inner.tasks.account_tasks.keys().copied().collect();
            for task_id in task_ids {
                let mut accounts = Vec::new();
                let mut roots = Vec::new();
                let mut subtask: Option<SubTaskRef> = None;
                let mut origin = H256::zero();
                let mut limit = MAX_HASH;
                {
                    let Some(task) = inner.tasks.account_tasks.get_mut(&task_id) else {
                        continue;
                    };
                    if task.sub_tasks.is_empty() && task.state_tasks.is_empty() {
                        continue;
                    }
                    // Prefer a large-contract chunk; those download one at a time.
                    'chunks: for (account, subtasks) in task.sub_tasks.iter_mut() {
                        for st in subtasks.iter_mut() {
                            if st.requested {
                                continue;
                            }
                            st.requested = true;
                            accounts.push(*account);
                            roots.push(st.root);
                            subtask = Some(SubTaskRef {
                                account: *account,
                                last: st.last,
                            });
                            origin = st.next;
                            limit = st.last;
                            break 'chunks;
                        }
                    }
                    if subtask.is_none() {
                        let drained: Vec<(H256, H256)> = task
                            .state_tasks
                            .iter()
                            .map(|(account, root)| (*account, *root))
                            .take(storage_sets)
                            .collect();
                        for (account, root) in drained {
                            task.state_tasks.remove(&account);
                            accounts.push(account);
                            roots.push(root);
                        }
                    }
                }
                // Nothing schedulable here; the task is fully in flight.
                if accounts.is_empty() {
                    continue;
                }
                let id = generate_id(|id| {
                    inner.requesting.storage_tasks.contains_key(&id)
                        || inner.retries.storage_tasks.contains_key(&id)
                        || inner.processing.storage_tasks.contains_key(&id)
                });
                let bundle = StorageTaskBundle {
                    id,
                    task_id,
                    accounts,
                    roots,
                    subtask,
                    origin,
                    limit,
                    cap: byte_cap,
                };
                batch.storages = Some(storage_request(&bundle, root));
                inner.requesting.storage_tasks.insert(id, bundle);
                break;
            }
        }

        if batch.len() > len_at_entry {
            return;
        }
        if !with_heal || !inner.tasks.snapped {
            return;
        }

        // 4. heal phase: refill the pending pool from the scheduler and carve
        // one trienode request and one bytecode request out of it.
        let cap = STATES_PER_REQUEST;
        if let Some(scheduler) = inner.scheduler.as_mut() {
            let (paths, hashes, codes) = scheduler.missing(cap);
            for (path, hash) in paths.into_iter().zip(hashes) {
                inner.heal_pool.trie_tasks.insert(path, hash);
            }
            for code in codes {
                inner.heal_pool.code_tasks.insert(code);
            }
        }

        if !inner.heal_pool.trie_tasks.is_empty() {
            let capped = cap.min(MAX_TRIE_REQUEST_COUNT);
            let throttled = ((capped as f64) / inner.trienode_heal_throttle) as usize;
            let take = throttled.max(1);
            let drained: Vec<(Vec<u8>, H256)> = inner
                .heal_pool
                .trie_tasks
                .iter()
                .map(|(path, hash)| (path.clone(), *hash))
                .take(take)
                .collect();
            for (path, _) in &drained {
                inner.heal_pool.trie_tasks.remove(path);
            }
            let (paths, hashes): (Vec<_>, Vec<_>) = drained.into_iter().unzip();
            let (paths, hashes, _, pathsets) = sort_by_account_path(paths, hashes);

            let id = generate_id(|id| healer_id_in_use(inner, id));
            let trie_tasks: BTreeMap<Vec<u8>, H256> =
                paths.iter().cloned().zip(hashes.iter().copied()).collect();
            batch.healtask = Some(TrienodeHealRequest {
                task_id: id,
                root,
                paths: paths.clone(),
                hashes: hashes.clone(),
                pathsets: pathsets.clone(),
            });
            self.trienode_heal_pend
                .fetch_add(paths.len() as u64, Ordering::Relaxed);
            inner.requesting.healer.insert(
                id,
                HealTask {
                    id,
                    trie_tasks,
                    code_tasks: Default::default(),
                    paths,
                    hashes,
                    pathsets,
                    root,
                    bytecode_req: false,
                },
            );
        }

        if !inner.heal_pool.code_tasks.is_empty() {
            let take = cap.min(MAX_CODE_REQUEST_COUNT);
            let hashes: Vec<H256> = inner
                .heal_pool
                .code_tasks
                .iter()
                .copied()
                .take(take)
                .collect();
            for hash in &hashes {
                inner.heal_pool.code_tasks.remove(hash);
            }
            let id = generate_id(|id| healer_id_in_use(inner, id));
            batch.codetask = Some(BytecodeHealRequest {
                task_id: id,
                hashes: hashes.clone(),
            });
            inner.requesting.healer.insert(
                id,
                HealTask {
                    id,
                    trie_tasks: Default::default(),
                    code_tasks: hashes.iter().copied().collect(),
                    paths: Vec::new(),
                    hashes,
                    pathsets: Vec::new(),
                    root,
                    bytecode_req: true,
                },
            );
        }
    }

    /// Moves every element of a failed dispatch from `requesting` back into
    /// `retries`, so the next batch serves it again first.
    pub fn handle_request_error(&self, failed: FailedRequest) {
        let mut inner = self.lock();
        debug!(?failed, "Re-queueing failed request");
        match failed {
            FailedRequest::Accounts(ids) => {
                for id in ids {
                    if let Some(task) = inner.requesting.account_tasks.remove(&id) {
                        inner.retries.account_tasks.insert(id, task);
                    }
                }
            }
            FailedRequest::Codes { task_id, hashes } => {
                for hash in hashes {
                    if inner.requesting.code_tasks.remove(&hash).is_some() {
                        inner.retries.code_tasks.insert(hash, task_id);
                    }
                }
            }
            FailedRequest::Storages(id) => {
                if let Some(bundle) = inner.requesting.storage_tasks.remove(&id) {
                    inner.retries.storage_tasks.insert(id, bundle);
                }
            }
            FailedRequest::TrienodeHeal(id) => {
                if let Some(task) = inner.requesting.healer.remove(&id) {
                    self.sub_heal_pend(task.paths.len());
                    inner.retries.healer.insert(id, task);
                }
            }
            FailedRequest::BytecodeHeal(id) => {
                if let Some(task) = inner.requesting.healer.remove(&id) {
                    inner.retries.healer.insert(id, task);
                }
            }
        }
    }

    pub(crate) fn sub_heal_pend(&self, n: usize) {
        let _ = self
            .trienode_heal_pend
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(n as u64))
            });
    }
}

fn healer_id_in_use(inner: &Inner, id: u64) -> bool {
    inner.requesting.healer.contains_key(&id)
        || inner.retries.healer.contains_key(&id)
        || inner.processing.healer.contains_key(&id)
}

fn storage_request(bundle: &StorageTaskBundle, root: H256) -> StorageRangeRequest {
    StorageRangeRequest {
        id: bundle.id,
        root,
        accounts: bundle.accounts.clone(),
        roots: bundle.roots.clone(),
        origin: bundle.origin,
        limit: bundle.limit,
        cap: bundle.cap,
    }
}

//! Response integration: folding verified account, bytecode, storage and heal
//! responses into the task registry, the flat snapshot and the trie builders.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use ethereum_types::{H256, U256};
use tracing::{debug, warn};

use vela_storage::{keys, HookedBatch, WriteBatch, IDEAL_BATCH_SIZE};
use vela_trie::SchedulerError;

use crate::constants::{
    MAX_REQUEST_SIZE, MAX_TRIENODE_HEAL_THROTTLE, MIN_TRIENODE_HEAL_THROTTLE,
    STORAGE_CONCURRENCY, TRIENODE_HEAL_RATE_MEASUREMENT_IMPACT, TRIENODE_HEAL_THROTTLE_DECREASE,
    TRIENODE_HEAL_THROTTLE_INCREASE,
};
use crate::range::{estimate_remaining_slots, inc_hash, HashRange};
use crate::requests::{
    AccountRangeResponse, BytecodeHealResponse, BytecodeResponse, StorageRangeResponse, StreamId,
    TrienodeHealResponse,
};
use crate::tasks::{AccountResponse, AccountTask, StorageTask, StorageTaskBundle, SubTaskRef};
use crate::SyncError;

use super::{Inner, StateDownloader};

impl StateDownloader {
    /// Integrates a verified account range response into its task.
    pub fn handle_account_request_result(
        &self,
        task_id: u64,
        response: AccountRangeResponse,
        stream_id: &StreamId,
    ) -> Result<(), SyncError> {
        let mut inner = self.lock();
        if let Some(task) = inner.requesting.account_tasks.remove(&task_id) {
            inner.processing.account_tasks.insert(task_id, task);
        } else {
            debug!(%stream_id, task = task_id, "Account range response for unknown task");
        }
        self.process_account_response(&mut inner, task_id, response)
    }

    fn process_account_response(
        &self,
        inner: &mut Inner,
        task_id: u64,
        mut response: AccountRangeResponse,
    ) -> Result<(), SyncError> {
        let Some(mut task) = inner.processing.account_tasks.remove(&task_id) else {
            return Err(SyncError::UnknownTask(task_id));
        };

        // Ensure the response doesn't overflow into the subsequent task
        let last = U256::from_big_endian(task.last.as_bytes());
        let mut cont = response.cont;
        let mut cut = response.hashes.len();
        for (i, hash) in response.hashes.iter().enumerate() {
            match U256::from_big_endian(hash.as_bytes()).cmp(&last) {
                CmpOrdering::Equal => cont = false,
                CmpOrdering::Greater => {
                    cut = i;
                    cont = false;
                    break;
                }
                CmpOrdering::Less => {}
            }
        }
        response.hashes.truncate(cut);
        response.accounts.truncate(cut);

        // Work out which accounts need further sub-filling before the range
        // can be persisted.
        let count = response.accounts.len();
        task.need_code = vec![false; count];
        task.need_state = vec![false; count];
        task.need_heal = vec![false; count];
        task.code_tasks.clear();
        task.state_tasks.clear();
        task.pend = 0;

        let mut resumed: BTreeSet<H256> = BTreeSet::new();
        for (i, account) in response.accounts.iter().enumerate() {
            if account.has_code() && !keys::has_code(&*self.store, account.code_hash)? {
                task.code_tasks.insert(account.code_hash);
                task.need_code[i] = true;
                task.pend += 1;
            }
            if account.has_storage()
                && !keys::has_trie_node(&*self.store, response.hashes[i], &[])?
            {
                if let Some(subtasks) = task.sub_tasks.get_mut(&response.hashes[i]) {
                    // A previous large retrieval was interrupted; keep its
                    // chunks but refresh the root they verify against.
                    debug!(account = ?response.hashes[i], root = ?account.storage_root,
                        "Resuming large storage retrieval");
                    for subtask in subtasks {
                        subtask.root = account.storage_root;
                    }
                    task.need_heal[i] = true;
                    resumed.insert(response.hashes[i]);
                } else {
                    task.state_tasks
                        .insert(response.hashes[i], account.storage_root);
                }
                task.need_state[i] = true;
                task.pend += 1;
            }
        }
        // Sub-tasks for accounts no longer in the response undo some progress,
        // but there is no way to resume them against an unknown root.
        task.sub_tasks.retain(|account, _| {
            let keep = resumed.contains(account);
            if !keep {
                debug!(?account, "Aborting suspended storage retrieval");
            }
            keep
        });

        task.res = Some(AccountResponse {
            hashes: response.hashes,
            accounts: response.accounts,
            cont,
        });
        if task.pend == 0 {
            self.forward_account_task(inner, &mut task)?;
        }
        inner.tasks.account_tasks.insert(task_id, task);
        Ok(())
    }

    /// Integrates delivered bytecodes, rescheduling any the peer skipped.
    pub fn handle_bytecode_request_result(
        &self,
        task_id: u64,
        hashes: Vec<H256>,
        response: BytecodeResponse,
        stream_id: &StreamId,
    ) -> Result<(), SyncError> {
        let mut inner = self.lock();
        for hash in &hashes {
            inner.requesting.code_tasks.remove(hash);
        }
        if let Some(task) = inner.tasks.account_tasks.remove(&task_id) {
            inner.processing.account_tasks.insert(task_id, task);
        } else {
            debug!(%stream_id, task = task_id, "Bytecode response for unknown task");
        }
        self.process_bytecode_response(&mut inner, task_id, hashes, response)
    }

    fn process_bytecode_response(
        &self,
        inner: &mut Inner,
        task_id: u64,
        hashes: Vec<H256>,
        response: BytecodeResponse,
    ) -> Result<(), SyncError> {
        let Some(mut task) = inner.processing.account_tasks.remove(&task_id) else {
            return Err(SyncError::UnknownTask(task_id));
        };

        let batch = WriteBatch::new();
        let mut delivered = 0u64;
        for (i, hash) in hashes.iter().enumerate() {
            match response.codes.get(i).and_then(|code| code.as_ref()) {
                // Undelivered, reschedule
                None => {
                    task.code_tasks.insert(*hash);
                }
                Some(code) => {
                    if let Some(res) = task.res.as_ref() {
                        for (j, account) in res.accounts.iter().enumerate() {
                            if task.need_code[j] && *hash == account.code_hash {
                                task.need_code[j] = false;
                                task.pend = task.pend.saturating_sub(1);
                            }
                        }
                    }
                    delivered += 1;
                    keys::write_code(&batch, *hash, code);
                }
            }
        }
        let bytes = batch.value_size() as u64;
        batch.write_to(&*self.store)?;
        inner.bytecode_synced += delivered;
        inner.bytecode_bytes += bytes;
        debug!(count = delivered, bytes, "Persisted set of bytecodes");

        // If this delivery completed the last pending obligation, forward the
        // account task to the next chunk.
        if task.pend == 0 {
            self.forward_account_task(inner, &mut task)?;
        }
        inner.tasks.account_tasks.insert(task_id, task);
        Ok(())
    }

    /// Integrates a storage range response for a bundle of accounts, or one
    /// chunk of a large contract.
    pub fn handle_storage_request_result(
        &self,
        bundle_id: u64,
        response: StorageRangeResponse,
        stream_id: &StreamId,
    ) -> Result<(), SyncError> {
        let mut inner = self.lock();
        if let Some(bundle) = inner.requesting.storage_tasks.remove(&bundle_id) {
            inner.processing.storage_tasks.insert(bundle_id, bundle);
        } else {
            debug!(%stream_id, bundle = bundle_id, "Storage response for unknown bundle");
        }
        self.process_storage_response(&mut inner, bundle_id, response)
    }

    fn process_storage_response(
        &self,
        inner: &mut Inner,
        bundle_id: u64,
        response: StorageRangeResponse,
    ) -> Result<(), SyncError> {
        let Some(bundle) = inner.processing.storage_tasks.remove(&bundle_id) else {
            return Err(SyncError::UnknownTask(bundle_id));
        };
        let Some(mut task) = inner.tasks.account_tasks.remove(&bundle.task_id) else {
            debug!(bundle = bundle_id, "Storage response for a vanished account task");
            return Ok(());
        };
        let result = self.integrate_storage_response(inner, &mut task, &bundle, response);
        inner.tasks.account_tasks.insert(bundle.task_id, task);
        result
    }

    fn integrate_storage_response(
        &self,
        inner: &mut Inner,
        task: &mut AccountTask,
        bundle: &StorageTaskBundle,
        mut response: StorageRangeResponse,
    ) -> Result<(), SyncError> {
        let batch = HookedBatch::new(self.storage_bytes.clone());
        let old_storage_bytes = self.storage_bytes.get();
        let delivered = response.hashes.len();
        let mut slot_count = 0usize;
        let mut cont = response.cont;

        // The chunk this bundle is filling, when it targets a large contract.
        let mut active: Option<(H256, usize)> = match bundle.subtask {
            Some(SubTaskRef { account, last }) => {
                let position = task
                    .sub_tasks
                    .get(&account)
                    .and_then(|list| list.iter().position(|st| st.last == last));
                match position {
                    Some(index) => Some((account, index)),
                    None => {
                        debug!(?account, "Storage response for a vanished sub-task");
                        return Ok(());
                    }
                }
            }
            None => None,
        };

        for i in 0..bundle.accounts.len() {
            let account = bundle.accounts[i];
            // Undelivered accounts get rescheduled wholesale.
            if i >= delivered {
                task.state_tasks.insert(account, bundle.roots[i]);
                continue;
            }
            let is_last = i == delivered - 1;

            // Locate the account inside the task's current response.
            let matched = task.res.as_ref().and_then(|res| {
                res.hashes
                    .iter()
                    .position(|hash| *hash == account)
                    .map(|j| (j, res.accounts[j].storage_root))
            });
            let Some((j, account_root)) = matched else {
                continue;
            };

            // All but the last contract in the packet are surely complete; the
            // last one may be chunked, so check the continuation flag.
            if active.is_none() && task.need_state[j] && (!is_last || !cont) {
                task.need_state[j] = false;
                task.pend = task.pend.saturating_sub(1);
            }
            // A chunked contract must not be written out prematurely: flag it
            // for healing so the boundary nodes get repaired.
            if active.is_none() && !task.need_heal[j] && is_last && cont {
                task.need_heal[j] = true;
            }
            // Switch to large-contract mode for a chunked tail.
            if active.is_none() && is_last && cont && !task.sub_tasks.contains_key(&account) {
                let slot_hashes = &response.hashes[i];
                let last_key = slot_hashes.last().copied().unwrap_or_default();
                let mut chunks = STORAGE_CONCURRENCY;
                // Chunk so that at least 2 packets are needed to fill a task.
                match estimate_remaining_slots(slot_hashes.len(), last_key) {
                    Ok(estimate) => {
                        let n = estimate / (2 * (MAX_REQUEST_SIZE as u64 / 64));
                        if n + 1 < chunks {
                            chunks = n + 1;
                        }
                        debug!(initiators = slot_hashes.len(), tail = ?last_key,
                            remaining = estimate, chunks, "Chunked large contract");
                    }
                    Err(_) => {
                        debug!(initiators = slot_hashes.len(), tail = ?last_key, chunks,
                            "Chunked large contract");
                    }
                }
                let mut range = HashRange::new(last_key, chunks);
                let mut subtasks: Vec<StorageTask> = Vec::new();
                // The first chunk is the one this response just filled.
                subtasks.push(self.new_storage_subtask(
                    account,
                    H256::zero(),
                    range.end(),
                    account_root,
                ));
                while range.next() {
                    subtasks.push(self.new_storage_subtask(
                        account,
                        range.start(),
                        range.end(),
                        account_root,
                    ));
                }
                for st in &subtasks {
                    debug!(from = ?st.next, last = ?st.last, root = ?account_root, ?account,
                        "Created storage sync task");
                }
                task.sub_tasks.insert(account, subtasks);
                active = Some((account, 0));
            }

            // In large-contract mode, trim the response at the chunk boundary
            // and forward the chunk cursor.
            if let Some((sub_account, index)) = active {
                if let Some(st) = task
                    .sub_tasks
                    .get_mut(&sub_account)
                    .and_then(|list| list.get_mut(index))
                {
                    let last = U256::from_big_endian(st.last.as_bytes());
                    let slot_hashes = &mut response.hashes[i];
                    let cut = slot_hashes
                        .partition_point(|h| U256::from_big_endian(h.as_bytes()) <= last);
                    if cut < slot_hashes.len() {
                        cont = false; // range ran past the chunk end
                    }
                    if cut > 0 && slot_hashes[cut - 1] == st.last {
                        cont = false; // range includes the chunk end
                    }
                    slot_hashes.truncate(cut);
                    response.slots[i].truncate(cut);
                    if cont {
                        if let Some(tail) = slot_hashes.last() {
                            st.next = inc_hash(*tail);
                        }
                    } else {
                        st.done = true;
                    }
                }
            }

            slot_count += response.hashes[i].len();

            // Complete contracts have their trie nodes reconstructed right
            // away; chunked ones keep feeding the long-lived builder below.
            if !is_last || active.is_none() {
                let mut trie = self.build_storage_trie(&batch, account);
                for (slot, value) in response.hashes[i].iter().zip(response.slots[i].iter()) {
                    trie.update(slot.as_bytes(), value.to_vec())?;
                }
                trie.commit()?;
            }
            for (slot, value) in response.hashes[i].iter().zip(response.slots[i].iter()) {
                keys::write_storage_snapshot(&batch, account, *slot, value);
                if is_last {
                    if let Some((sub_account, index)) = active {
                        if let Some(st) = task
                            .sub_tasks
                            .get_mut(&sub_account)
                            .and_then(|list| list.get_mut(index))
                        {
                            if let Some(trie) = st.gen_trie.as_mut() {
                                trie.update(slot.as_bytes(), value.to_vec())?;
                            }
                        }
                    }
                }
            }
        }

        // A finished chunk may have completed the whole contract: if its trie
        // commits to the expected root, the account needs no healing.
        if let Some((sub_account, index)) = active {
            let mut full_delivery = false;
            if let Some(st) = task
                .sub_tasks
                .get_mut(&sub_account)
                .and_then(|list| list.get_mut(index))
            {
                if st.done {
                    if let Some(trie) = st.gen_trie.as_mut() {
                        let root = trie.commit()?;
                        full_delivery = root == st.root;
                    }
                }
                if st.gen_batch.value_size() > IDEAL_BATCH_SIZE || st.done {
                    st.gen_batch.write_to(&*self.store)?;
                    st.gen_batch.reset();
                }
            }
            if full_delivery {
                let matches: Vec<usize> = task
                    .res
                    .as_ref()
                    .map(|res| {
                        res.hashes
                            .iter()
                            .enumerate()
                            .filter(|(_, hash)| **hash == sub_account)
                            .map(|(j, _)| j)
                            .collect()
                    })
                    .unwrap_or_default();
                for j in matches {
                    task.need_heal[j] = false;
                }
            }
        }

        batch.write_to(&*self.store)?;
        inner.storage_synced += slot_count as u64;
        debug!(
            accounts = delivered,
            slots = slot_count,
            bytes = self.storage_bytes.get() - old_storage_bytes,
            "Persisted set of storage slots"
        );

        if task.pend == 0 {
            self.forward_account_task(inner, task)?;
        }
        Ok(())
    }

    fn new_storage_subtask(
        &self,
        account: H256,
        next: H256,
        last: H256,
        root: H256,
    ) -> StorageTask {
        let gen_batch = HookedBatch::new(self.storage_bytes.clone());
        let gen_trie = Some(self.build_storage_trie(&gen_batch, account));
        StorageTask {
            next,
            last,
            root,
            gen_batch,
            gen_trie,
            requested: false,
            done: false,
        }
    }

    /// Feeds delivered trie nodes into the scheduler and retunes the heal
    /// throttle from the measured processing rate.
    pub fn handle_trienode_heal_request_result(
        &self,
        task_id: u64,
        response: TrienodeHealResponse,
        stream_id: &StreamId,
    ) -> Result<(), SyncError> {
        let mut inner = self.lock();
        if let Some(task) = inner.requesting.healer.remove(&task_id) {
            inner.processing.healer.insert(task_id, task);
        } else {
            debug!(%stream_id, task = task_id, "Trienode heal response for unknown task");
        }
        self.process_trienode_heal_response(&mut inner, task_id, response)
    }

    fn process_trienode_heal_response(
        &self,
        inner: &mut Inner,
        task_id: u64,
        response: TrienodeHealResponse,
    ) -> Result<(), SyncError> {
        let Some(task) = inner.processing.healer.remove(&task_id) else {
            return Err(SyncError::UnknownTask(task_id));
        };
        self.sub_heal_pend(task.paths.len());

        let start = Instant::now();
        let mut fills = 0u64;
        for (i, path) in task.paths.iter().enumerate() {
            match response.nodes.get(i).and_then(|node| node.as_ref()) {
                // Undelivered, re-queue for the next heal request
                None => {
                    inner
                        .heal_pool
                        .trie_tasks
                        .insert(path.clone(), task.hashes[i]);
                }
                Some(node) => {
                    fills += 1;
                    inner.trienode_heal_synced += 1;
                    inner.trienode_heal_bytes += node.len() as u64;
                    let Some(scheduler) = inner.scheduler.as_mut() else {
                        return Err(SyncError::RootNotSet);
                    };
                    match scheduler.process_node(path, node) {
                        Ok(()) => {}
                        Err(SchedulerError::AlreadyProcessed) => inner.trienode_heal_dups += 1,
                        Err(SchedulerError::NotRequested) => inner.trienode_heal_nops += 1,
                        Err(err) => {
                            warn!(%err, hash = ?task.hashes[i], "Invalid trienode processed")
                        }
                    }
                }
            }
        }
        self.commit_healer(inner, false)?;

        // Update the measured trienode throughput. The rate must move once per
        // node rather than once per batch to stay comparable across varying
        // packet sizes; the per-node EMA telescopes into the closed form
        //   HR(N) = (1-MI)^N * (HR - rate) + rate
        let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
        let rate = fills as f64 / elapsed;
        inner.trienode_heal_rate = (1.0 - TRIENODE_HEAL_RATE_MEASUREMENT_IMPACT)
            .powi(fills as i32)
            * (inner.trienode_heal_rate - rate)
            + rate;

        let pending = self.trienode_heal_pend.load(Ordering::Relaxed);
        if inner.trienode_heal_throttled.elapsed() > Duration::from_secs(1) {
            if pending as f64 > 2.0 * inner.trienode_heal_rate {
                inner.trienode_heal_throttle *= TRIENODE_HEAL_THROTTLE_INCREASE;
            } else {
                inner.trienode_heal_throttle /= TRIENODE_HEAL_THROTTLE_DECREASE;
            }
            inner.trienode_heal_throttle = inner
                .trienode_heal_throttle
                .clamp(MIN_TRIENODE_HEAL_THROTTLE, MAX_TRIENODE_HEAL_THROTTLE);
            inner.trienode_heal_throttled = Instant::now();
            debug!(
                rate = inner.trienode_heal_rate,
                pending,
                throttle = inner.trienode_heal_throttle,
                "Updated trie node heal throttler"
            );
        }
        Ok(())
    }

    /// Feeds healed bytecodes into the scheduler.
    pub fn handle_bytecode_heal_request_result(
        &self,
        task_id: u64,
        response: BytecodeHealResponse,
        stream_id: &StreamId,
    ) -> Result<(), SyncError> {
        let mut inner = self.lock();
        if let Some(task) = inner.requesting.healer.remove(&task_id) {
            inner.processing.healer.insert(task_id, task);
        } else {
            debug!(%stream_id, task = task_id, "Bytecode heal response for unknown task");
        }
        self.process_bytecode_heal_response(&mut inner, task_id, response)
    }

    fn process_bytecode_heal_response(
        &self,
        inner: &mut Inner,
        task_id: u64,
        response: BytecodeHealResponse,
    ) -> Result<(), SyncError> {
        let Some(task) = inner.processing.healer.remove(&task_id) else {
            return Err(SyncError::UnknownTask(task_id));
        };
        for (i, hash) in task.hashes.iter().enumerate() {
            match response.codes.get(i).and_then(|code| code.as_ref()) {
                None => {
                    inner.heal_pool.code_tasks.insert(*hash);
                }
                Some(code) => {
                    inner.bytecode_heal_synced += 1;
                    inner.bytecode_heal_bytes += code.len() as u64;
                    let Some(scheduler) = inner.scheduler.as_mut() else {
                        return Err(SyncError::RootNotSet);
                    };
                    match scheduler.process_code(*hash, code) {
                        Ok(()) => {}
                        Err(SchedulerError::AlreadyProcessed) => inner.bytecode_heal_dups += 1,
                        Err(SchedulerError::NotRequested) => inner.bytecode_heal_nops += 1,
                        Err(err) => warn!(%err, ?hash, "Invalid bytecode processed"),
                    }
                }
            }
        }
        self.commit_healer(inner, false)
    }
}

//! End-to-end scenarios for the state download manager, driven with scripted
//! payloads against the mock collaborators.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ethereum_types::{H256, U256};

use vela_common::constants::{EMPTY_CODE_HASH, EMPTY_TRIE_HASH, MAX_HASH};
use vela_common::types::{slim_account_rlp, AccountState};
use vela_storage::{keys, KeyValueStore};

use crate::range::inc_hash;
use crate::requests::{
    AccountRangeResponse, BytecodeResponse, FailedRequest, StorageRangeResponse,
    TrienodeHealResponse,
};
use crate::stage::StateSyncStage;
use crate::testutil::{fold_root, harness, harness_with_store, stream_id, EmptyRangeClient};
use crate::SyncError;

fn root() -> H256 {
    H256::repeat_byte(0x42)
}

fn eoa(nonce: u64) -> AccountState {
    AccountState {
        nonce,
        balance: U256::from(nonce * 1000),
        storage_root: EMPTY_TRIE_HASH,
        code_hash: EMPTY_CODE_HASH,
    }
}

fn empty_response() -> AccountRangeResponse {
    AccountRangeResponse {
        hashes: Vec::new(),
        accounts: Vec::new(),
        cont: false,
    }
}

#[test]
fn fresh_start_partitions_the_account_space() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();

    let inner = h.downloader.lock();
    assert_eq!(inner.tasks.account_tasks.len(), 16);
    let mut intervals: Vec<(H256, H256)> = inner
        .tasks
        .account_tasks
        .values()
        .map(|task| (task.next, task.last))
        .collect();
    intervals.sort();
    assert_eq!(intervals[0].0, H256::zero());
    assert_eq!(intervals.last().unwrap().1, MAX_HASH);
    for pair in intervals.windows(2) {
        assert_eq!(inc_hash(pair[0].1), pair[1].0, "intervals must tile");
    }
    for task in inner.tasks.account_tasks.values() {
        assert_ne!(task.id, 0);
    }
    assert!(!inner.tasks.snapped);
}

// S1: sixteen empty range responses complete the range phase and the final
// flush runs.
#[test]
fn empty_chain_completes_after_sixteen_responses() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();

    let batch = h.downloader.next_batch().unwrap();
    assert_eq!(batch.accounts.len(), 16);
    for req in &batch.accounts {
        h.downloader
            .handle_account_request_result(req.task_id, empty_response(), &stream_id())
            .unwrap();
    }
    // every task went straight to done
    {
        let inner = h.downloader.lock();
        assert!(inner.tasks.account_tasks.values().all(|t| t.done));
    }

    let batch = h.downloader.next_batch().unwrap();
    assert!(batch.is_empty());
    assert!(h.downloader.is_snapped());
    assert!(h.downloader.is_completed());
    // all sixteen interval tries were sealed and the checkpoint was written
    assert_eq!(h.commits.lock().unwrap().len(), 16);
    assert!(keys::read_snapshot_sync_status(&*h.store)
        .unwrap()
        .is_some());
}

// S2: a full range of plain accounts persists slim encodings, seals the trie
// and pushes the cursor past the last hash.
#[test]
fn plain_account_range_persists_and_advances() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();

    let batch = h.downloader.next_batch().unwrap();
    let req = batch
        .accounts
        .iter()
        .find(|r| r.origin == H256::zero())
        .expect("first interval was dispatched");

    let hashes: Vec<H256> = (1..=3).map(H256::from_low_u64_be).collect();
    let accounts: Vec<AccountState> = (1..=3).map(eoa).collect();
    h.downloader
        .handle_account_request_result(
            req.task_id,
            AccountRangeResponse {
                hashes: hashes.clone(),
                accounts: accounts.clone(),
                cont: false,
            },
            &stream_id(),
        )
        .unwrap();

    let inner = h.downloader.lock();
    let task = &inner.tasks.account_tasks[&req.task_id];
    assert!(task.done);
    assert_eq!(task.next, H256::from_low_u64_be(4));
    assert_eq!(inner.account_synced, 3);
    drop(inner);

    assert_eq!(h.store.count_prefix(keys::account_snapshot_prefix()), 3);
    for (hash, account) in hashes.iter().zip(&accounts) {
        assert_eq!(
            keys::read_account_snapshot(&*h.store, *hash).unwrap(),
            Some(slim_account_rlp(account))
        );
    }
    assert_eq!(h.commits.lock().unwrap().len(), 1, "one seal per interval");
}

// Invariant: the cursor only moves forward across successive responses for
// the same task.
#[test]
fn cursor_is_monotone_across_continuations() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();

    let batch = h.downloader.next_batch().unwrap();
    let req = batch
        .accounts
        .iter()
        .find(|r| r.origin == H256::zero())
        .unwrap();

    h.downloader
        .handle_account_request_result(
            req.task_id,
            AccountRangeResponse {
                hashes: vec![H256::from_low_u64_be(1), H256::from_low_u64_be(2)],
                accounts: vec![eoa(1), eoa(2)],
                cont: true,
            },
            &stream_id(),
        )
        .unwrap();
    let after_first = h.downloader.lock().tasks.account_tasks[&req.task_id].next;
    assert_eq!(after_first, H256::from_low_u64_be(3));

    // the unfinished interval is re-dispatched from the new cursor
    let batch = h.downloader.next_batch().unwrap();
    let again = batch
        .accounts
        .iter()
        .find(|r| r.task_id == req.task_id)
        .expect("continuation re-dispatched");
    assert_eq!(again.origin, after_first);

    h.downloader
        .handle_account_request_result(
            req.task_id,
            AccountRangeResponse {
                hashes: vec![H256::from_low_u64_be(5)],
                accounts: vec![eoa(5)],
                cont: false,
            },
            &stream_id(),
        )
        .unwrap();
    let inner = h.downloader.lock();
    let task = &inner.tasks.account_tasks[&req.task_id];
    assert!(task.next > after_first);
    assert!(task.done);
}

// Responses overflowing the interval end are trimmed and terminate the range.
#[test]
fn overflowing_response_is_trimmed() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();

    let batch = h.downloader.next_batch().unwrap();
    // pick any interval that is not the last one
    let req = batch
        .accounts
        .iter()
        .find(|r| r.limit != MAX_HASH)
        .unwrap();
    let inside = req.limit;
    let outside = inc_hash(req.limit);

    h.downloader
        .handle_account_request_result(
            req.task_id,
            AccountRangeResponse {
                hashes: vec![inside, outside],
                accounts: vec![eoa(1), eoa(2)],
                cont: true,
            },
            &stream_id(),
        )
        .unwrap();

    let inner = h.downloader.lock();
    let task = &inner.tasks.account_tasks[&req.task_id];
    assert!(task.done, "trimmed range with the boundary included is final");
    assert_eq!(
        task.res.as_ref().map(|res| res.hashes.len()),
        None,
        "response was consumed by the forward"
    );
    assert_eq!(inner.account_synced, 1, "the overflowing account is dropped");
}

// S3: an account with unknown code queues a bytecode task; delivering the
// code unblocks the interval.
#[test]
fn contract_bytecode_roundtrip() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();

    let code_hash = H256::repeat_byte(0xcc);
    let account_hash = H256::from_low_u64_be(0x10);
    let account = AccountState {
        nonce: 1,
        balance: U256::from(7),
        storage_root: EMPTY_TRIE_HASH,
        code_hash,
    };

    let batch = h.downloader.next_batch().unwrap();
    let req = batch
        .accounts
        .iter()
        .find(|r| r.origin == H256::zero())
        .unwrap();
    h.downloader
        .handle_account_request_result(
            req.task_id,
            AccountRangeResponse {
                hashes: vec![account_hash],
                accounts: vec![account],
                cont: false,
            },
            &stream_id(),
        )
        .unwrap();
    {
        let inner = h.downloader.lock();
        let task = &inner.tasks.account_tasks[&req.task_id];
        assert_eq!(task.pend, 1);
        assert!(task.need_code[0]);
        assert!(task.code_tasks.contains(&code_hash));
        assert!(!task.done);
    }

    // the code task rides the next dispatch round
    let batch = h.downloader.next_batch().unwrap();
    let codes = batch.codes.expect("bytecode request dispatched");
    assert_eq!(codes.task_id, req.task_id);
    assert_eq!(codes.hashes, vec![code_hash]);

    h.downloader
        .handle_bytecode_request_result(
            codes.task_id,
            codes.hashes.clone(),
            BytecodeResponse {
                codes: vec![Some(Bytes::from_static(b"\x60\x80"))],
            },
            &stream_id(),
        )
        .unwrap();

    let inner = h.downloader.lock();
    let task = &inner.tasks.account_tasks[&req.task_id];
    assert_eq!(task.pend, 0);
    assert!(task.done);
    assert!(task.next > account_hash);
    assert_eq!(inner.bytecode_synced, 1);
    drop(inner);
    assert!(keys::has_code(&*h.store, code_hash).unwrap());
}

// Undelivered bytecodes go back on the task's queue.
#[test]
fn missing_bytecode_is_rescheduled() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();

    let code_hash = H256::repeat_byte(0xcd);
    let batch = h.downloader.next_batch().unwrap();
    let req = batch
        .accounts
        .iter()
        .find(|r| r.origin == H256::zero())
        .unwrap();
    h.downloader
        .handle_account_request_result(
            req.task_id,
            AccountRangeResponse {
                hashes: vec![H256::from_low_u64_be(0x11)],
                accounts: vec![AccountState {
                    nonce: 1,
                    balance: U256::one(),
                    storage_root: EMPTY_TRIE_HASH,
                    code_hash,
                }],
                cont: false,
            },
            &stream_id(),
        )
        .unwrap();

    let batch = h.downloader.next_batch().unwrap();
    let codes = batch.codes.unwrap();
    h.downloader
        .handle_bytecode_request_result(
            codes.task_id,
            codes.hashes,
            BytecodeResponse { codes: vec![None] },
            &stream_id(),
        )
        .unwrap();

    let inner = h.downloader.lock();
    let task = &inner.tasks.account_tasks[&req.task_id];
    assert_eq!(task.pend, 1, "undelivered code keeps the task pending");
    assert!(task.code_tasks.contains(&code_hash));
}

struct LargeContract {
    account_hash: H256,
    storage_root: H256,
    first_slots: Vec<(H256, Bytes)>,
    closing_slot: (H256, Bytes),
}

// 100 slots ending at 2^248 project to ~25.5k remaining, which chunks the
// contract into two sub-tasks.
fn large_contract() -> LargeContract {
    let mut first_slots: Vec<(H256, Bytes)> = (1..100u64)
        .map(|i| (H256::from_low_u64_be(i), Bytes::from(vec![i as u8])))
        .collect();
    let mut tail = [0u8; 32];
    tail[0] = 0x01;
    first_slots.push((H256(tail), Bytes::from_static(b"\xff")));

    let mut closing = [0u8; 32];
    closing[0] = 0x01;
    closing[31] = 0x01;
    let closing_slot = (H256(closing), Bytes::from_static(b"\xee"));

    // The chunk trie sees the first response's slots and then the closing
    // one; its committed root must equal the account's storage root for the
    // heal flag to clear.
    let mut leaves: Vec<(Vec<u8>, Vec<u8>)> = first_slots
        .iter()
        .map(|(k, v)| (k.as_bytes().to_vec(), v.to_vec()))
        .collect();
    leaves.push((
        closing_slot.0.as_bytes().to_vec(),
        closing_slot.1.to_vec(),
    ));
    LargeContract {
        account_hash: H256::from_low_u64_be(0x20),
        storage_root: fold_root(&leaves),
        first_slots,
        closing_slot,
    }
}

// S4: a continued storage range flips the account into chunked mode.
#[test]
fn large_contract_is_chunked() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();
    let contract = large_contract();

    let batch = h.downloader.next_batch().unwrap();
    let req = batch
        .accounts
        .iter()
        .find(|r| r.origin == H256::zero())
        .unwrap();
    h.downloader
        .handle_account_request_result(
            req.task_id,
            AccountRangeResponse {
                hashes: vec![contract.account_hash],
                accounts: vec![AccountState {
                    nonce: 1,
                    balance: U256::one(),
                    storage_root: contract.storage_root,
                    code_hash: EMPTY_CODE_HASH,
                }],
                cont: false,
            },
            &stream_id(),
        )
        .unwrap();

    let batch = h.downloader.next_batch().unwrap();
    let storages = batch.storages.expect("storage bundle dispatched");
    assert_eq!(storages.accounts, vec![contract.account_hash]);
    assert_eq!(storages.roots, vec![contract.storage_root]);

    let (hashes, slots): (Vec<H256>, Vec<Bytes>) =
        contract.first_slots.iter().cloned().unzip();
    h.downloader
        .handle_storage_request_result(
            storages.id,
            StorageRangeResponse {
                hashes: vec![hashes.clone()],
                slots: vec![slots],
                cont: true,
            },
            &stream_id(),
        )
        .unwrap();

    let inner = h.downloader.lock();
    let task = &inner.tasks.account_tasks[&req.task_id];
    assert!(task.need_heal[0], "chunked contract needs healing");
    assert!(task.need_state[0], "chunked contract is still pending");
    assert_eq!(task.pend, 1);

    let subtasks = &task.sub_tasks[&contract.account_hash];
    assert_eq!(subtasks.len(), 2, "estimate chunks the contract in two");
    assert_eq!(subtasks[0].next, inc_hash(*hashes.last().unwrap()));
    assert!(!subtasks[0].done);
    assert_eq!(subtasks[1].last, MAX_HASH);
    assert_eq!(inc_hash(subtasks[0].last), subtasks[1].next);
    assert_eq!(inner.storage_synced, 100);
    drop(inner);
    assert_eq!(h.store.count_prefix(keys::storage_snapshot_prefix()), 100);
}

// S4 continued: finishing the chunk whose trie commits to the account root
// clears the heal flag.
#[test]
fn completed_chunk_with_matching_root_clears_heal_flag() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();
    let contract = large_contract();

    let batch = h.downloader.next_batch().unwrap();
    let req = batch
        .accounts
        .iter()
        .find(|r| r.origin == H256::zero())
        .unwrap();
    h.downloader
        .handle_account_request_result(
            req.task_id,
            AccountRangeResponse {
                hashes: vec![contract.account_hash],
                accounts: vec![AccountState {
                    nonce: 1,
                    balance: U256::one(),
                    storage_root: contract.storage_root,
                    code_hash: EMPTY_CODE_HASH,
                }],
                cont: false,
            },
            &stream_id(),
        )
        .unwrap();

    let batch = h.downloader.next_batch().unwrap();
    let storages = batch.storages.unwrap();
    let (hashes, slots): (Vec<H256>, Vec<Bytes>) =
        contract.first_slots.iter().cloned().unzip();
    h.downloader
        .handle_storage_request_result(
            storages.id,
            StorageRangeResponse {
                hashes: vec![hashes],
                slots: vec![slots],
                cont: true,
            },
            &stream_id(),
        )
        .unwrap();

    // the first chunk is re-dispatched from its new cursor
    let batch = h.downloader.next_batch().unwrap();
    let chunk_req = batch.storages.expect("chunk bundle dispatched");
    assert_eq!(chunk_req.origin, inc_hash(contract.first_slots.last().unwrap().0));

    h.downloader
        .handle_storage_request_result(
            chunk_req.id,
            StorageRangeResponse {
                hashes: vec![vec![contract.closing_slot.0]],
                slots: vec![vec![contract.closing_slot.1.clone()]],
                cont: false,
            },
            &stream_id(),
        )
        .unwrap();

    let inner = h.downloader.lock();
    let task = &inner.tasks.account_tasks[&req.task_id];
    assert!(
        !task.need_heal[0],
        "full delivery against the expected root needs no healing"
    );
    let subtasks = &task.sub_tasks[&contract.account_hash];
    assert!(subtasks[0].done);
    assert_eq!(inner.storage_synced, 101);
}

// Accounts the peer skipped in a storage bundle are rescheduled wholesale.
#[test]
fn undelivered_storage_accounts_are_rescheduled() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();

    let roots: Vec<H256> = (1..=2).map(|i| H256::repeat_byte(0x30 + i)).collect();
    let hashes: Vec<H256> = (0x21..=0x22u64).map(H256::from_low_u64_be).collect();
    let batch = h.downloader.next_batch().unwrap();
    let req = batch
        .accounts
        .iter()
        .find(|r| r.origin == H256::zero())
        .unwrap();
    h.downloader
        .handle_account_request_result(
            req.task_id,
            AccountRangeResponse {
                hashes: hashes.clone(),
                accounts: roots
                    .iter()
                    .map(|root| AccountState {
                        nonce: 1,
                        balance: U256::one(),
                        storage_root: *root,
                        code_hash: EMPTY_CODE_HASH,
                    })
                    .collect(),
                cont: false,
            },
            &stream_id(),
        )
        .unwrap();

    let batch = h.downloader.next_batch().unwrap();
    let storages = batch.storages.unwrap();
    assert_eq!(storages.accounts.len(), 2);

    // only the first account is served
    h.downloader
        .handle_storage_request_result(
            storages.id,
            StorageRangeResponse {
                hashes: vec![vec![H256::from_low_u64_be(9)]],
                slots: vec![vec![Bytes::from_static(b"\x01")]],
                cont: false,
            },
            &stream_id(),
        )
        .unwrap();

    let inner = h.downloader.lock();
    let task = &inner.tasks.account_tasks[&req.task_id];
    assert_eq!(task.pend, 1, "skipped account keeps the task pending");
    assert_eq!(task.state_tasks.get(&hashes[1]), Some(&roots[1]));
    assert!(!task.need_state[0]);
    assert!(task.need_state[1]);
}

// S5: failed dispatches land exclusively in retries and are served first.
#[test]
fn failed_requests_retry_first() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();

    let batch = h.downloader.next_batch().unwrap();
    let failed: Vec<u64> = batch.accounts.iter().take(2).map(|r| r.task_id).collect();
    h.downloader
        .handle_request_error(FailedRequest::Accounts(failed.clone()));

    {
        let inner = h.downloader.lock();
        for id in &failed {
            assert!(inner.retries.account_tasks.contains_key(id));
            assert!(!inner.requesting.account_tasks.contains_key(id));
        }
    }

    let batch = h.downloader.next_batch().unwrap();
    let redispatched: Vec<u64> = batch.accounts.iter().map(|r| r.task_id).collect();
    assert_eq!(redispatched.len(), 2, "only the failed tasks are free");
    for id in &failed {
        assert!(redispatched.contains(id));
    }
    let inner = h.downloader.lock();
    assert!(inner.retries.account_tasks.is_empty());
}

// Save-then-load reproduces the interval set and counters bit-exactly.
#[test]
fn checkpoint_roundtrip_restores_tasks_and_counters() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();
    let contract = large_contract();

    // make some progress: one finished interval, one chunked contract
    let batch = h.downloader.next_batch().unwrap();
    let first = batch
        .accounts
        .iter()
        .find(|r| r.origin == H256::zero())
        .unwrap();
    h.downloader
        .handle_account_request_result(
            first.task_id,
            AccountRangeResponse {
                hashes: vec![contract.account_hash],
                accounts: vec![AccountState {
                    nonce: 1,
                    balance: U256::one(),
                    storage_root: contract.storage_root,
                    code_hash: EMPTY_CODE_HASH,
                }],
                cont: false,
            },
            &stream_id(),
        )
        .unwrap();
    let batch = h.downloader.next_batch().unwrap();
    let storages = batch.storages.unwrap();
    let (hashes, slots): (Vec<H256>, Vec<Bytes>) =
        contract.first_slots.iter().cloned().unzip();
    h.downloader
        .handle_storage_request_result(
            storages.id,
            StorageRangeResponse {
                hashes: vec![hashes],
                slots: vec![slots],
                cont: true,
            },
            &stream_id(),
        )
        .unwrap();
    h.downloader.checkpoint().unwrap();

    // in-flight intervals are part of the checkpoint too
    let saved: Vec<(H256, H256, usize)> = {
        let inner = h.downloader.lock();
        let mut intervals: Vec<(H256, H256, usize)> = inner
            .tasks
            .account_tasks
            .values()
            .chain(inner.requesting.account_tasks.values())
            .chain(inner.retries.account_tasks.values())
            .map(|task| (task.next, task.last, task.sub_tasks.len()))
            .collect();
        intervals.sort();
        intervals
    };
    assert_eq!(saved.len(), 16, "every interval survives, in flight or not");
    let saved_synced = {
        let inner = h.downloader.lock();
        (inner.account_synced, inner.storage_synced)
    };

    // a fresh downloader over the same store resumes from the checkpoint
    let resumed = harness_with_store(Arc::clone(&h.store), 16);
    resumed.downloader.set_root_hash(root()).unwrap();
    let inner = resumed.downloader.lock();
    let mut intervals: Vec<(H256, H256, usize)> = inner
        .tasks
        .account_tasks
        .values()
        .map(|task| (task.next, task.last, task.sub_tasks.len()))
        .collect();
    intervals.sort();
    assert_eq!(intervals, saved);
    assert_eq!(
        (inner.account_synced, inner.storage_synced),
        saved_synced
    );
    // ids are regenerated from the map keys
    for (id, task) in inner.tasks.account_tasks.iter() {
        assert_eq!(*id, task.id);
        assert_ne!(task.id, 0);
    }
    // the chunk intervals survived
    let chunked = inner
        .tasks
        .account_tasks
        .values()
        .find(|task| !task.sub_tasks.is_empty())
        .expect("chunked contract survived the restart");
    assert_eq!(chunked.sub_tasks[&contract.account_hash].len(), 2);
}

// Invariant: a forced healer commit leaves the scheduler's buffer empty.
#[test]
fn forced_healer_commit_drains_the_buffer() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();

    h.scheduler
        .buffered
        .lock()
        .unwrap()
        .push((b"node-key".to_vec(), b"node-value".to_vec()));
    h.scheduler.mem_size.store(64, Ordering::Relaxed);

    let mut inner = h.downloader.lock();
    h.downloader.commit_healer(&mut inner, true).unwrap();
    drop(inner);

    assert_eq!(h.scheduler.mem_size.load(Ordering::Relaxed), 0);
    assert!(h.scheduler.buffered.lock().unwrap().is_empty());
    assert_eq!(h.store.get(b"node-key").unwrap(), Some(b"node-value".to_vec()));
}

// An unforced commit below the batch threshold is a no-op.
#[test]
fn unforced_healer_commit_respects_threshold() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();

    h.scheduler
        .buffered
        .lock()
        .unwrap()
        .push((b"small".to_vec(), b"batch".to_vec()));
    h.scheduler.mem_size.store(64, Ordering::Relaxed);

    let mut inner = h.downloader.lock();
    h.downloader.commit_healer(&mut inner, false).unwrap();
    drop(inner);
    assert_eq!(h.scheduler.mem_size.load(Ordering::Relaxed), 64);
    assert_eq!(h.store.get(b"small").unwrap(), None);
}

fn drive_to_heal_phase(h: &crate::testutil::Harness) {
    let batch = h.downloader.next_batch().unwrap();
    for req in &batch.accounts {
        h.downloader
            .handle_account_request_result(req.task_id, empty_response(), &stream_id())
            .unwrap();
    }
}

// S6: the heal throttle follows the pending/rate ratio and stays clamped.
#[test]
fn heal_throttle_adjusts_and_stays_clamped() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();
    h.scheduler.pending.store(10, Ordering::Relaxed);
    drive_to_heal_phase(&h);

    let heal_paths: Vec<Vec<u8>> = (0u8..3).map(|i| vec![i]).collect();
    let heal_hashes: Vec<H256> = (1..=3).map(H256::from_low_u64_be).collect();
    h.scheduler
        .missing
        .lock()
        .unwrap()
        .push_back((heal_paths.clone(), heal_hashes, Vec::new()));

    let batch = h.downloader.next_batch().unwrap();
    assert!(h.downloader.is_snapped());
    let heal = batch.healtask.expect("heal task dispatched");
    assert_eq!(heal.paths.len(), 3);
    assert_eq!(
        h.downloader.trienode_heal_pend.load(Ordering::Relaxed),
        3,
        "dispatch tracks pending heal nodes"
    );

    // Decrease branch: low pending, stale adjustment clock
    {
        let mut inner = h.downloader.lock();
        inner.trienode_heal_throttle = 2.0;
        inner.trienode_heal_throttled = Instant::now() - Duration::from_secs(2);
    }
    h.downloader
        .handle_trienode_heal_request_result(
            heal.task_id,
            TrienodeHealResponse {
                nodes: heal
                    .paths
                    .iter()
                    .map(|_| Some(Bytes::from_static(b"\x01")))
                    .collect(),
            },
            &stream_id(),
        )
        .unwrap();
    {
        let inner = h.downloader.lock();
        assert_eq!(inner.trienode_heal_throttle, 2.0 / 1.25);
        assert_eq!(inner.trienode_heal_synced, 3);
    }
    assert_eq!(h.downloader.trienode_heal_pend.load(Ordering::Relaxed), 0);
    assert_eq!(h.scheduler.processed_nodes.lock().unwrap().len(), 3);

    // Increase branch: enormous pending backlog, near the clamp ceiling
    h.scheduler
        .missing
        .lock()
        .unwrap()
        .push_back((vec![vec![9u8]], vec![H256::from_low_u64_be(9)], Vec::new()));
    let batch = h.downloader.next_batch().unwrap();
    let heal = batch.healtask.expect("second heal task dispatched");
    {
        let mut inner = h.downloader.lock();
        inner.trienode_heal_throttle = 1000.0;
        inner.trienode_heal_throttled = Instant::now() - Duration::from_secs(2);
    }
    h.downloader
        .trienode_heal_pend
        .store(1 << 62, Ordering::Relaxed);
    h.downloader
        .handle_trienode_heal_request_result(
            heal.task_id,
            TrienodeHealResponse {
                nodes: vec![Some(Bytes::from_static(b"\x02"))],
            },
            &stream_id(),
        )
        .unwrap();
    let inner = h.downloader.lock();
    assert_eq!(
        inner.trienode_heal_throttle, 1024.0,
        "increase clamps at the max trie request count"
    );
}

// Undelivered heal nodes re-queue and ride the next heal dispatch.
#[test]
fn undelivered_heal_nodes_requeue() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();
    h.scheduler.pending.store(10, Ordering::Relaxed);
    drive_to_heal_phase(&h);

    h.scheduler.missing.lock().unwrap().push_back((
        vec![vec![1u8], vec![2u8]],
        vec![H256::from_low_u64_be(1), H256::from_low_u64_be(2)],
        vec![H256::repeat_byte(0xaa)],
    ));
    let batch = h.downloader.next_batch().unwrap();
    let heal = batch.healtask.unwrap();
    let codes = batch.codetask.expect("bytecode heal task dispatched");
    assert_eq!(codes.hashes, vec![H256::repeat_byte(0xaa)]);

    // nothing is delivered
    h.downloader
        .handle_trienode_heal_request_result(
            heal.task_id,
            TrienodeHealResponse {
                nodes: vec![None, None],
            },
            &stream_id(),
        )
        .unwrap();
    h.downloader
        .handle_bytecode_heal_request_result(
            codes.task_id,
            crate::requests::BytecodeHealResponse { codes: vec![None] },
            &stream_id(),
        )
        .unwrap();

    let inner = h.downloader.lock();
    assert_eq!(inner.heal_pool.trie_tasks.len(), 2);
    assert!(inner.heal_pool.code_tasks.contains(&H256::repeat_byte(0xaa)));
    drop(inner);

    // the re-queued work goes out again without touching the scheduler
    let batch = h.downloader.next_batch().unwrap();
    let heal = batch.healtask.expect("requeued heal task dispatched");
    assert_eq!(heal.paths.len(), 2);
}

// A heal dispatch failure re-queues the task and rebalances the pending gauge.
#[test]
fn failed_heal_dispatch_lands_in_retries() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();
    h.scheduler.pending.store(10, Ordering::Relaxed);
    drive_to_heal_phase(&h);

    h.scheduler.missing.lock().unwrap().push_back((
        vec![vec![7u8]],
        vec![H256::from_low_u64_be(7)],
        Vec::new(),
    ));
    let batch = h.downloader.next_batch().unwrap();
    let heal = batch.healtask.unwrap();
    h.downloader
        .handle_request_error(FailedRequest::TrienodeHeal(heal.task_id));
    assert_eq!(h.downloader.trienode_heal_pend.load(Ordering::Relaxed), 0);
    {
        let inner = h.downloader.lock();
        assert!(inner.retries.healer.contains_key(&heal.task_id));
        assert!(!inner.requesting.healer.contains_key(&heal.task_id));
    }

    let batch = h.downloader.next_batch().unwrap();
    let retried = batch.healtask.expect("retried heal task dispatched");
    assert_eq!(retried.task_id, heal.task_id);
    assert_eq!(retried.paths, heal.paths);
}

// Responses for unknown tasks are rejected without panicking.
#[test]
fn response_for_unknown_task_is_an_error() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();
    let err = h
        .downloader
        .handle_account_request_result(0xdead, empty_response(), &stream_id())
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownTask(0xdead)));
}

// Healed flat state flows through the shared state writer and is flushed by
// the completion path.
#[test]
fn healed_state_flushes_on_completion() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();

    {
        let mut sink = h.heal_sink.lock().unwrap();
        let sink = sink.as_mut().expect("scheduler construction handed over a sink");
        use vela_rlp::encode::RLPEncode;
        let account = eoa(3);
        sink.on_heal_state(
            &[H256::from_low_u64_be(0x77).as_bytes().to_vec()],
            &account.encode_to_vec(),
        );
        sink.on_heal_state(
            &[
                H256::from_low_u64_be(0x77).as_bytes().to_vec(),
                H256::from_low_u64_be(0x01).as_bytes().to_vec(),
            ],
            b"\x2a",
        );
    }
    // nothing hit the store yet, the shared writer buffers it
    assert_eq!(h.store.count_prefix(keys::account_snapshot_prefix()), 0);

    drive_to_heal_phase(&h);
    let _ = h.downloader.next_batch().unwrap();
    assert!(h.downloader.is_completed());
    assert_eq!(h.store.count_prefix(keys::account_snapshot_prefix()), 1);
    assert_eq!(h.store.count_prefix(keys::storage_snapshot_prefix()), 1);
}

// The stage drives the manager end to end against a peer, including the
// transport-failure retry path.
#[tokio::test]
async fn stage_runs_to_completion_with_retries() {
    let h = harness(16);
    h.downloader.set_root_hash(root()).unwrap();

    let client = Arc::new(EmptyRangeClient::default());
    client.fail_first.store(2, Ordering::Relaxed);
    let stage = StateSyncStage::new(
        Arc::clone(&h.downloader),
        Arc::clone(&client),
        tokio_util::sync::CancellationToken::new(),
    );
    stage.run().await.unwrap();

    assert!(h.downloader.is_completed());
    assert_eq!(
        client.account_calls.load(Ordering::Relaxed),
        16,
        "every interval was eventually served"
    );
}

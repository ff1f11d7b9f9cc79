//! Deterministic mock collaborators for the sync tests: a fold-hash stack
//! trie, a scriptable trie scheduler, a mock chain/engine pair and peers that
//! serve canned payloads.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ethereum_types::H256;
use tokio::sync::broadcast;

use vela_common::types::{Block, BlockHeader, CommitSignature};
use vela_storage::InMemoryStore;
use vela_trie::{
    HealLeafSink, SchedulerError, StackTrie, StackTrieFactory, TrieError, TrieNodeSink,
    TrieScheduler, TrieSchedulerFactory,
};

use crate::chain::{BlockChain, ChainError, Engine, EngineError};
use crate::driver::{StreamManager, SyncCycle};
use crate::requests::{
    AccountRangeRequest, AccountRangeResponse, BytecodeResponse, RequestError, SnapPeerClient,
    StorageRangeRequest, StorageRangeResponse, StreamId, TrienodeHealRequest,
    TrienodeHealResponse,
};
use crate::state_sync::StateDownloader;
use crate::SyncError;

pub fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Deterministic stand-in for a trie root: folds the leaves into an H256 so
/// tests can predict what a builder will commit.
pub fn fold_root(leaves: &[(Vec<u8>, Vec<u8>)]) -> H256 {
    let mut acc: u64 = 0xcbf2_9ce4_8422_2325;
    for (key, value) in leaves {
        for byte in key.iter().chain(value.iter()) {
            acc ^= *byte as u64;
            acc = acc.wrapping_mul(0x0000_0100_0000_01b3);
        }
        acc = acc.rotate_left(17) ^ 0x9e37_79b9_7f4a_7c15;
    }
    let mut out = [0u8; 32];
    for i in 0..4 {
        out[i * 8..(i + 1) * 8].copy_from_slice(&acc.rotate_left(i as u32 * 13).to_be_bytes());
    }
    H256(out)
}

struct MockStackTrie {
    sink: Box<dyn TrieNodeSink>,
    leaves: Vec<(Vec<u8>, Vec<u8>)>,
    committed: bool,
    commits: Arc<Mutex<Vec<H256>>>,
}

impl StackTrie for MockStackTrie {
    fn update(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TrieError> {
        if self.committed {
            return Err(TrieError::AlreadyCommitted);
        }
        self.leaves.push((key.to_vec(), value));
        Ok(())
    }

    fn commit(&mut self) -> Result<H256, TrieError> {
        if self.committed {
            return Err(TrieError::AlreadyCommitted);
        }
        self.committed = true;
        let root = fold_root(&self.leaves);
        self.sink
            .write_node(&[], root, &(self.leaves.len() as u64).to_be_bytes());
        lock(&self.commits).push(root);
        Ok(root)
    }
}

/// Factory handing out fold-hash builders and recording every committed root.
#[derive(Default)]
pub struct MockTrieFactory {
    pub commits: Arc<Mutex<Vec<H256>>>,
}

impl StackTrieFactory for MockTrieFactory {
    fn build(&self, sink: Box<dyn TrieNodeSink>) -> Box<dyn StackTrie> {
        Box::new(MockStackTrie {
            sink,
            leaves: Vec::new(),
            committed: false,
            commits: Arc::clone(&self.commits),
        })
    }
}

/// Scriptable scheduler state shared between a test and the scheduler the
/// downloader constructs.
#[derive(Default)]
pub struct SchedulerState {
    /// Queue of `missing()` results to serve.
    pub missing: Mutex<VecDeque<(Vec<Vec<u8>>, Vec<H256>, Vec<H256>)>>,
    pub pending: AtomicUsize,
    pub mem_size: AtomicUsize,
    pub processed_nodes: Mutex<Vec<Vec<u8>>>,
    pub processed_codes: Mutex<Vec<H256>>,
    /// Forced classification per node path; anything else processes fine.
    pub node_verdicts: Mutex<BTreeMap<Vec<u8>, SchedulerError>>,
    /// Key/value pairs drained by the next `commit`.
    pub buffered: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
}

struct MockScheduler {
    state: Arc<SchedulerState>,
}

impl TrieScheduler for MockScheduler {
    fn missing(&mut self, max: usize) -> (Vec<Vec<u8>>, Vec<H256>, Vec<H256>) {
        let Some((mut paths, mut hashes, codes)) = lock(&self.state.missing).pop_front() else {
            return (Vec::new(), Vec::new(), Vec::new());
        };
        paths.truncate(max);
        hashes.truncate(max);
        (paths, hashes, codes)
    }

    fn process_node(&mut self, path: &[u8], _node: &[u8]) -> Result<(), SchedulerError> {
        lock(&self.state.processed_nodes).push(path.to_vec());
        if let Some(verdict) = lock(&self.state.node_verdicts).get(path) {
            return Err(verdict.clone());
        }
        let _ = self
            .state
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
        Ok(())
    }

    fn process_code(&mut self, hash: H256, _code: &[u8]) -> Result<(), SchedulerError> {
        lock(&self.state.processed_codes).push(hash);
        let _ = self
            .state
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
        Ok(())
    }

    fn pending(&self) -> usize {
        self.state.pending.load(Ordering::Relaxed)
    }

    fn mem_size(&self) -> usize {
        self.state.mem_size.load(Ordering::Relaxed)
    }

    fn commit(&mut self, write: &mut dyn FnMut(&[u8], &[u8])) -> Result<(), TrieError> {
        for (key, value) in lock(&self.state.buffered).drain(..) {
            write(&key, &value);
        }
        self.state.mem_size.store(0, Ordering::Relaxed);
        Ok(())
    }
}

pub struct MockSchedulerFactory {
    pub state: Arc<SchedulerState>,
    /// The heal-leaf sink handed over at construction, kept so tests can
    /// drive the callback path.
    pub sink: Arc<Mutex<Option<Box<dyn HealLeafSink>>>>,
}

impl MockSchedulerFactory {
    pub fn new(state: Arc<SchedulerState>) -> Self {
        Self {
            state,
            sink: Arc::new(Mutex::new(None)),
        }
    }
}

impl TrieSchedulerFactory for MockSchedulerFactory {
    fn create(&self, _root: H256, leaf_sink: Box<dyn HealLeafSink>) -> Box<dyn TrieScheduler> {
        *lock(&self.sink) = Some(leaf_sink);
        Box::new(MockScheduler {
            state: Arc::clone(&self.state),
        })
    }
}

/// Everything a state-sync test needs wired together.
pub struct Harness {
    pub downloader: Arc<StateDownloader>,
    pub store: Arc<InMemoryStore>,
    pub commits: Arc<Mutex<Vec<H256>>>,
    pub scheduler: Arc<SchedulerState>,
    pub heal_sink: Arc<Mutex<Option<Box<dyn HealLeafSink>>>>,
}

pub fn harness(concurrency: u64) -> Harness {
    harness_with_store(Arc::new(InMemoryStore::new()), concurrency)
}

pub fn harness_with_store(store: Arc<InMemoryStore>, concurrency: u64) -> Harness {
    let tries = Arc::new(MockTrieFactory::default());
    let commits = Arc::clone(&tries.commits);
    let scheduler = Arc::new(SchedulerState::default());
    let factory = Arc::new(MockSchedulerFactory::new(Arc::clone(&scheduler)));
    let heal_sink = Arc::clone(&factory.sink);
    let downloader = Arc::new(StateDownloader::new(
        Arc::clone(&store) as Arc<dyn vela_storage::KeyValueStore>,
        tries,
        factory,
        concurrency,
    ));
    Harness {
        downloader,
        store,
        commits,
        scheduler,
        heal_sink,
    }
}

pub fn stream_id() -> StreamId {
    StreamId("mock-peer".into())
}

#[derive(Default)]
pub struct ChainState {
    pub inserted: Mutex<Vec<u64>>,
    pub verified_sigs: Mutex<Vec<CommitSignature>>,
    pub fail_sig_at: Mutex<BTreeSet<u64>>,
    pub fail_header_at: Mutex<BTreeMap<u64, String>>,
    pub fail_insert_at: Mutex<BTreeSet<u64>>,
}

pub struct MockEngine {
    state: Arc<ChainState>,
}

impl Engine for MockEngine {
    fn verify_header_signature(
        &self,
        _chain: &dyn BlockChain,
        header: &BlockHeader,
        signature: &CommitSignature,
        _bitmap: &[u8],
    ) -> Result<(), EngineError> {
        lock(&self.state.verified_sigs).push(*signature);
        if lock(&self.state.fail_sig_at).contains(&header.number) {
            return Err(EngineError::InvalidSignature("forced failure".into()));
        }
        Ok(())
    }

    fn verify_header(
        &self,
        _chain: &dyn BlockChain,
        header: &BlockHeader,
        _verify_seal: bool,
    ) -> Result<(), EngineError> {
        if let Some(reason) = lock(&self.state.fail_header_at).get(&header.number) {
            return Err(EngineError::InvalidHeader(reason.clone()));
        }
        Ok(())
    }
}

pub struct MockChain {
    pub state: Arc<ChainState>,
    engine: MockEngine,
    shard_id: u32,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::with_shard(0)
    }
}

impl MockChain {
    pub fn with_shard(shard_id: u32) -> Self {
        let state = Arc::new(ChainState::default());
        Self {
            engine: MockEngine {
                state: Arc::clone(&state),
            },
            state,
            shard_id,
        }
    }

    pub fn inserted(&self) -> Vec<u64> {
        lock(&self.state.inserted).clone()
    }

    pub fn verified_signatures(&self) -> Vec<CommitSignature> {
        lock(&self.state.verified_sigs).clone()
    }

    pub fn fail_signature_at(&self, number: u64) {
        lock(&self.state.fail_sig_at).insert(number);
    }

    pub fn fail_header_at(&self, number: u64, err: EngineError) {
        let reason = match err {
            EngineError::InvalidHeader(reason) | EngineError::InvalidSignature(reason) => reason,
        };
        lock(&self.state.fail_header_at).insert(number, reason);
    }

    pub fn fail_insert_at(&self, number: u64) {
        lock(&self.state.fail_insert_at).insert(number);
    }
}

impl BlockChain for MockChain {
    fn shard_id(&self) -> u32 {
        self.shard_id
    }

    fn current_block_number(&self) -> u64 {
        lock(&self.state.inserted).last().copied().unwrap_or(0)
    }

    fn engine(&self) -> &dyn Engine {
        &self.engine
    }

    fn insert_chain(&self, blocks: Vec<Block>, _verify_headers: bool) -> Result<usize, ChainError> {
        let mut inserted = 0;
        for block in &blocks {
            if lock(&self.state.fail_insert_at).contains(&block.number()) {
                return Err(ChainError::Custom("forced insert failure".into()));
            }
            lock(&self.state.inserted).push(block.number());
            inserted += 1;
        }
        Ok(inserted)
    }
}

pub struct MockStreamManager {
    count: AtomicUsize,
    added: broadcast::Sender<()>,
}

impl Default for MockStreamManager {
    fn default() -> Self {
        let (added, _) = broadcast::channel(16);
        Self {
            count: AtomicUsize::new(0),
            added,
        }
    }
}

impl MockStreamManager {
    pub fn add_stream(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self.added.send(());
    }
}

impl StreamManager for MockStreamManager {
    fn num_streams(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn subscribe_stream_added(&self) -> broadcast::Receiver<()> {
        self.added.subscribe()
    }
}

/// Sync cycle stub replaying scripted results; defaults to "no blocks added".
#[derive(Default)]
pub struct MockCycle {
    pub results: Mutex<VecDeque<Result<u64, SyncError>>>,
    pub calls: Mutex<Vec<(bool, tokio::time::Instant)>>,
}

#[async_trait]
impl SyncCycle for MockCycle {
    async fn run(&self, init_sync: bool) -> Result<u64, SyncError> {
        lock(&self.calls).push((init_sync, tokio::time::Instant::now()));
        lock(&self.results).pop_front().unwrap_or(Ok(0))
    }
}

#[derive(Default)]
pub struct MockBeacon {
    pub started: AtomicUsize,
    pub closed: AtomicUsize,
    pub inserts: AtomicUsize,
}

impl crate::beacon::BeaconHelper for MockBeacon {
    fn start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    fn insert_sync(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Peer that answers every range with "nothing there", failing the first
/// `fail_first` account requests with a timeout.
#[derive(Default)]
pub struct EmptyRangeClient {
    pub account_calls: AtomicUsize,
    pub fail_first: AtomicUsize,
}

#[async_trait]
impl SnapPeerClient for EmptyRangeClient {
    async fn get_account_range(
        &self,
        _req: &AccountRangeRequest,
    ) -> Result<(AccountRangeResponse, StreamId), RequestError> {
        if self
            .fail_first
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok()
        {
            return Err(RequestError::Timeout);
        }
        self.account_calls.fetch_add(1, Ordering::Relaxed);
        Ok((
            AccountRangeResponse {
                hashes: Vec::new(),
                accounts: Vec::new(),
                cont: false,
            },
            stream_id(),
        ))
    }

    async fn get_byte_codes(
        &self,
        hashes: &[H256],
        _cap: usize,
    ) -> Result<(BytecodeResponse, StreamId), RequestError> {
        Ok((
            BytecodeResponse {
                codes: hashes.iter().map(|_| None).collect(),
            },
            stream_id(),
        ))
    }

    async fn get_storage_ranges(
        &self,
        _req: &StorageRangeRequest,
    ) -> Result<(StorageRangeResponse, StreamId), RequestError> {
        Ok((
            StorageRangeResponse {
                hashes: Vec::new(),
                slots: Vec::new(),
                cont: false,
            },
            stream_id(),
        ))
    }

    async fn get_trie_nodes(
        &self,
        req: &TrienodeHealRequest,
    ) -> Result<(TrienodeHealResponse, StreamId), RequestError> {
        Ok((
            TrienodeHealResponse {
                nodes: req.paths.iter().map(|_| None).collect(),
            },
            stream_id(),
        ))
    }
}

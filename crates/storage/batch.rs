use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{KeyValueStore, StoreError};

/// Batch flush threshold: writes accumulate in memory until roughly this many
/// bytes are queued, then the owner flushes them to the store in one shot.
pub const IDEAL_BATCH_SIZE: usize = 100 * 1024;

/// Anything that accepts buffered key/value writes. Implemented by the batch
/// types so the key helpers in [`crate::keys`] work against either.
pub trait KeyValueWriter {
    fn put_kv(&self, key: Vec<u8>, value: Vec<u8>);
}

#[derive(Default)]
struct BatchInner {
    writes: Vec<(Vec<u8>, Vec<u8>)>,
    size: usize,
}

/// A write buffer shared between its owner and the trie builders feeding it.
/// Clones refer to the same underlying buffer.
#[derive(Clone, Default)]
pub struct WriteBatch {
    inner: Arc<Mutex<BatchInner>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BatchInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        let mut inner = self.lock();
        inner.size += key.len() + value.len();
        inner.writes.push((key, value));
    }

    /// Bytes queued in the batch (keys plus values).
    pub fn value_size(&self) -> usize {
        self.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.lock().writes.is_empty()
    }

    /// Flushes all queued writes to the store. The buffer is kept; call
    /// [`WriteBatch::reset`] afterwards to reuse it.
    pub fn write_to(&self, store: &dyn KeyValueStore) -> Result<(), StoreError> {
        let inner = self.lock();
        for (key, value) in &inner.writes {
            store.put(key, value)?;
        }
        Ok(())
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.writes.clear();
        inner.size = 0;
    }
}

impl KeyValueWriter for WriteBatch {
    fn put_kv(&self, key: Vec<u8>, value: Vec<u8>) {
        self.put(key, value);
    }
}

/// Shared byte counter fed by [`HookedBatch`] on every put. The sync keeps one
/// per persisted-bytes statistic and threads clones of it through the batches
/// that contribute to it.
#[derive(Clone, Default)]
pub struct SizeCounter(Arc<AtomicU64>);

impl SizeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A [`WriteBatch`] that reports the size of every put to a [`SizeCounter`].
#[derive(Clone, Default)]
pub struct HookedBatch {
    batch: WriteBatch,
    on_put: SizeCounter,
}

impl HookedBatch {
    pub fn new(on_put: SizeCounter) -> Self {
        Self {
            batch: WriteBatch::new(),
            on_put,
        }
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        self.on_put.add((key.len() + value.len()) as u64);
        self.batch.put(key, value);
    }

    pub fn value_size(&self) -> usize {
        self.batch.value_size()
    }

    pub fn write_to(&self, store: &dyn KeyValueStore) -> Result<(), StoreError> {
        self.batch.write_to(store)
    }

    pub fn reset(&self) {
        self.batch.reset();
    }
}

impl KeyValueWriter for HookedBatch {
    fn put_kv(&self, key: Vec<u8>, value: Vec<u8>) {
        self.put(key, value);
    }
}

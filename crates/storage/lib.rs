mod batch;
mod in_memory;

pub mod error;
pub mod keys;

pub use batch::{HookedBatch, KeyValueWriter, SizeCounter, WriteBatch, IDEAL_BATCH_SIZE};
pub use error::StoreError;
pub use in_memory::InMemoryStore;
pub use keys::BatchNodeSink;

/// The host key-value database. The snapshot sync only needs point reads and
/// writes; batching, key layout and trie-node routing live on top of this.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }
}

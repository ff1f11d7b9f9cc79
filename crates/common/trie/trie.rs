pub mod error;
pub mod nibbles;
pub mod sync;

pub use error::TrieError;
pub use sync::{
    HealLeafSink, SchedulerError, StackTrie, StackTrieFactory, SyncPath, TrieNodeSink,
    TrieScheduler, TrieSchedulerFactory,
};

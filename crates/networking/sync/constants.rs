//! Tuning knobs of the snapshot sync. The request caps are part of the peer
//! protocol contract and must match across the network.

use std::time::Duration;

/// Minimum number of bytes to request from a remote peer. Low cap for account
/// and storage range requests; bytecode and trienode requests are bounded by
/// item count instead.
pub const MIN_REQUEST_SIZE: usize = 64 * 1024;

/// Maximum number of bytes to request from a remote peer. High cap for account
/// and storage range requests.
pub const MAX_REQUEST_SIZE: usize = 512 * 1024;

/// Maximum number of bytecode blobs to request in a single query. Deployed
/// bytecodes are capped at 24KB; most contracts stay well under that, so
/// requesting 4x the worst-case fill is a good approximation.
pub const MAX_CODE_REQUEST_COUNT: usize = MAX_REQUEST_SIZE * 4 / (24 * 1024);

/// Maximum number of trie node blobs to request in a single query.
pub const MAX_TRIE_REQUEST_COUNT: usize = MAX_REQUEST_SIZE / 512;

/// Number of chunks the account hash space is split into for concurrent
/// retrieval.
pub const ACCOUNT_CONCURRENCY: u64 = 16;

/// Number of chunks a large contract storage trie is split into for concurrent
/// retrieval.
pub const STORAGE_CONCURRENCY: u64 = 16;

/// Upper bound on items handed out per dispatch round.
pub const STATES_PER_REQUEST: usize = 100;

/// Impact a single measurement has on the measured trienode processing
/// capacity. Closer to 0 reacts slower to sudden changes but resists
/// temporary hiccups.
pub const TRIENODE_HEAL_RATE_MEASUREMENT_IMPACT: f64 = 0.005;

/// Minimum divisor for throttling trienode heal requests.
pub const MIN_TRIENODE_HEAL_THROTTLE: f64 = 1.0;

/// Maximum divisor for throttling trienode heal requests.
pub const MAX_TRIENODE_HEAL_THROTTLE: f64 = MAX_TRIE_REQUEST_COUNT as f64;

/// Multiplier for the throttle when data arrives faster than it is processed.
pub const TRIENODE_HEAL_THROTTLE_INCREASE: f64 = 1.33;

/// Divisor for the throttle when data arrives slower than it is processed.
pub const TRIENODE_HEAL_THROTTLE_DECREASE: f64 = 1.25;

/// Cadence of the sync driver's cycle trigger.
pub const SYNC_LOOP_TICK: Duration = Duration::from_secs(10);

/// Ceiling on offering a trigger to the (unbuffered) download channel.
pub const TRIGGER_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause before re-arming the trigger after a failed cycle.
pub const POST_ERROR_SLEEP: Duration = Duration::from_secs(5);

/// Pause before the driver loop continues after a failed cycle.
pub const PRE_CONTINUE_SLEEP: Duration = Duration::from_secs(1);

/// Cadence of the peer-count recheck while waiting for bootstrap discovery.
pub const BOOT_RECHECK_INTERVAL: Duration = Duration::from_secs(10);

use std::sync::LazyLock;

use prometheus::{IntCounter, Registry};

pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::default);

#[derive(Debug)]
pub struct Metrics {
    _registry: Registry,

    /// Sync cycles triggered by consensus via `download_async`.
    pub consensus_triggered_download: IntCounter,
    /// Sync cycles that ran to completion.
    pub sync_cycles_completed: IntCounter,
    /// Sync cycles that failed and were retried.
    pub sync_cycles_failed: IntCounter,
    /// Blocks appended to the chain by the sync.
    pub blocks_inserted: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        let registry = Registry::new();
        let consensus_triggered_download = IntCounter::new(
            "sync_consensus_triggered_download",
            "Number of sync cycles triggered by consensus",
        )
        .expect("metric definition is static");
        let sync_cycles_completed = IntCounter::new(
            "sync_cycles_completed",
            "Number of completed sync cycles",
        )
        .expect("metric definition is static");
        let sync_cycles_failed =
            IntCounter::new("sync_cycles_failed", "Number of failed sync cycles")
                .expect("metric definition is static");
        let blocks_inserted = IntCounter::new(
            "sync_blocks_inserted",
            "Number of blocks inserted by the sync",
        )
        .expect("metric definition is static");
        for metric in [
            &consensus_triggered_download,
            &sync_cycles_completed,
            &sync_cycles_failed,
            &blocks_inserted,
        ] {
            registry
                .register(Box::new(metric.clone()))
                .expect("metric registration is static");
        }
        Self {
            _registry: registry,
            consensus_triggered_download,
            sync_cycles_completed,
            sync_cycles_failed,
            blocks_inserted,
        }
    }
}

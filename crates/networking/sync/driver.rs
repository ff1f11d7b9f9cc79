//! The sync driver: waits for enough peers to bootstrap, then repeatedly
//! kicks sync cycles — on a timer, when consensus asks for one, and
//! immediately after a cycle that moved the chain forward.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::beacon::BeaconHelper;
use crate::chain::BlockChain;
use crate::constants::{
    BOOT_RECHECK_INTERVAL, POST_ERROR_SLEEP, PRE_CONTINUE_SLEEP, SYNC_LOOP_TICK,
    TRIGGER_SEND_TIMEOUT,
};
use crate::metrics::METRICS;
use crate::SyncError;

/// Peer stream pool of this shard, as far as the driver cares: how many
/// streams are live and a way to hear about new ones.
pub trait StreamManager: Send + Sync {
    fn num_streams(&self) -> usize;
    fn subscribe_stream_added(&self) -> broadcast::Receiver<()>;
}

/// One full run of the staged sync pipeline. The first run of a session uses
/// `init_sync` for the cold bootstrap path.
#[async_trait]
pub trait SyncCycle: Send + Sync {
    /// Returns the number of blocks added to the chain.
    async fn run(&self, init_sync: bool) -> Result<u64, SyncError>;
}

#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// Streams required before the first cycle may start.
    pub init_streams: usize,
    pub shard_id: u32,
    /// Account-space chunking handed down to the state download.
    pub concurrency: u64,
}

impl DriverConfig {
    /// Clamps nonsensical values to usable defaults.
    pub fn fix_values(&mut self) {
        if self.init_streams == 0 {
            self.init_streams = 8;
        }
        if self.concurrency == 0 {
            self.concurrency = crate::constants::ACCOUNT_CONCURRENCY;
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            init_streams: 8,
            shard_id: 0,
            concurrency: crate::constants::ACCOUNT_CONCURRENCY,
        }
    }
}

/// Drives sync for one shard: booting -> running -> closed.
pub struct SyncDriver {
    config: DriverConfig,
    chain: Arc<dyn BlockChain>,
    streams: Arc<dyn StreamManager>,
    cycle: Arc<dyn SyncCycle>,
    beacon: Option<Arc<dyn BeaconHelper>>,

    download_tx: mpsc::Sender<()>,
    download_rx: Mutex<Option<mpsc::Receiver<()>>>,
    cancel: CancellationToken,

    evt_started: broadcast::Sender<()>,
    evt_finished: broadcast::Sender<()>,
    evt_started_subscribed: AtomicBool,
    evt_finished_subscribed: AtomicBool,
}

impl SyncDriver {
    pub fn new(
        mut config: DriverConfig,
        chain: Arc<dyn BlockChain>,
        streams: Arc<dyn StreamManager>,
        cycle: Arc<dyn SyncCycle>,
        beacon: Option<Arc<dyn BeaconHelper>>,
    ) -> Self {
        config.fix_values();
        let (download_tx, download_rx) = mpsc::channel(1);
        let (evt_started, _) = broadcast::channel(16);
        let (evt_finished, _) = broadcast::channel(16);
        Self {
            config,
            chain,
            streams,
            cycle,
            beacon,
            download_tx,
            download_rx: Mutex::new(Some(download_rx)),
            cancel: CancellationToken::new(),
            evt_started,
            evt_finished,
            evt_started_subscribed: AtomicBool::new(false),
            evt_finished_subscribed: AtomicBool::new(false),
        }
    }

    /// Spawns the driver loop. Safe to call once.
    pub fn start(self: &Arc<Self>) {
        let driver = Arc::clone(self);
        tokio::spawn(async move {
            if driver.wait_for_boot().await {
                driver.run_loop().await;
            }
        });
        if let Some(beacon) = &self.beacon {
            beacon.start();
        }
    }

    /// Cancels the driver loop and any in-flight cycle work.
    pub fn close(&self) {
        self.cancel.cancel();
        if let Some(beacon) = &self.beacon {
            beacon.close();
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn num_peers(&self) -> usize {
        self.streams.num_streams()
    }

    /// Offers a sync trigger without blocking the caller for more than the
    /// send ceiling; a full queue drops the trigger on the floor.
    pub async fn download_async(&self) {
        if self
            .download_tx
            .send_timeout((), TRIGGER_SEND_TIMEOUT)
            .await
            .is_ok()
        {
            METRICS.consensus_triggered_download.inc();
        }
    }

    /// Subscribing is idempotent; events are only emitted once somebody did.
    pub fn subscribe_download_started(&self) -> broadcast::Receiver<()> {
        self.evt_started_subscribed.store(true, Ordering::Relaxed);
        self.evt_started.subscribe()
    }

    pub fn subscribe_download_finished(&self) -> broadcast::Receiver<()> {
        self.evt_finished_subscribed.store(true, Ordering::Relaxed);
        self.evt_finished.subscribe()
    }

    /// Blocks until the stream manager has finished initial discovery and
    /// holds enough peers to start downloading. Returns false on shutdown.
    async fn wait_for_boot(&self) -> bool {
        let mut events = self.streams.subscribe_stream_added();
        let mut ticker = tokio::time::interval(BOOT_RECHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("waiting for initial bootstrap discovery");
        loop {
            if self.streams.num_streams() >= self.config.init_streams {
                return true;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = events.recv() => {}
                _ = self.cancel.cancelled() => return false,
            }
        }
    }

    async fn run_loop(&self) {
        let mut download_rx = {
            let mut slot = match self.download_rx.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            match slot.take() {
                Some(rx) => rx,
                None => {
                    warn!("sync driver loop started twice");
                    return;
                }
            }
        };

        // First tick lands one full period out; the explicit trigger below
        // covers the immediate cycle.
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + SYNC_LOOP_TICK,
            SYNC_LOOP_TICK,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut init_sync = true;
        self.spawn_trigger(Duration::ZERO);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.spawn_trigger(Duration::ZERO);
                }
                received = download_rx.recv() => {
                    if received.is_none() {
                        return;
                    }
                    if self.evt_started_subscribed.load(Ordering::Relaxed) {
                        let _ = self.evt_started.send(());
                    }
                    match self.cycle.run(init_sync).await {
                        Err(err) => {
                            // Sleep a little and retry
                            warn!(%err, bootstrap = init_sync, "failed to download");
                            METRICS.sync_cycles_failed.inc();
                            self.spawn_trigger(POST_ERROR_SLEEP);
                            tokio::time::sleep(PRE_CONTINUE_SLEEP).await;
                            continue;
                        }
                        Ok(added) => {
                            info!(
                                blocks_added = added,
                                current_height = self.chain.current_block_number(),
                                init_sync,
                                shard = self.config.shard_id,
                                "sync finished"
                            );
                            METRICS.sync_cycles_completed.inc();
                            if self.evt_finished_subscribed.load(Ordering::Relaxed) {
                                let _ = self.evt_finished.send(());
                            }
                            if added != 0 {
                                METRICS.blocks_inserted.inc_by(added);
                                // The chain moved; trigger another cycle right
                                // away and drain last-mile blocks on shard 0.
                                self.spawn_trigger(Duration::ZERO);
                                if self.config.shard_id == 0 {
                                    if let Some(beacon) = &self.beacon {
                                        beacon.insert_sync();
                                    }
                                }
                            }
                            init_sync = false;
                        }
                    }
                }
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    fn spawn_trigger(&self, delay: Duration) {
        let tx = self.download_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send_timeout((), TRIGGER_SEND_TIMEOUT).await;
        });
    }
}

//! Secondary ingestion path on the beacon shard: last-mile blocks received
//! out-of-band get inserted after a successful sync cycle. Only the interface
//! lives here; the host node provides the implementation.

pub trait BeaconHelper: Send + Sync {
    fn start(&self);
    fn close(&self);
    /// Called by the driver after a non-empty sync cycle on shard 0 to drain
    /// the out-of-band block queue.
    fn insert_sync(&self);
}

//! The state-download stage: pulls request batches out of the manager, maps
//! each non-empty slot onto one protocol call, and feeds the responses (or
//! failures) back in. Runs until the manager reports the cycle complete.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::MAX_REQUEST_SIZE;
use crate::requests::{FailedRequest, SnapPeerClient};
use crate::state_sync::StateDownloader;
use crate::SyncError;

/// Pause between polls when every task is in flight and there is nothing new
/// to dispatch.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct StateSyncStage<C> {
    downloader: Arc<StateDownloader>,
    client: Arc<C>,
    cancel: CancellationToken,
}

impl<C: SnapPeerClient + 'static> StateSyncStage<C> {
    pub fn new(downloader: Arc<StateDownloader>, client: Arc<C>, cancel: CancellationToken) -> Self {
        Self {
            downloader,
            client,
            cancel,
        }
    }

    /// Drives the state download for one target root until the manager has
    /// nothing left to fetch and no pending heal work.
    pub async fn run(&self) -> Result<(), SyncError> {
        info!(root = ?self.downloader.root(), "Starting state download");
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let batch = self.downloader.next_batch()?;
            if batch.is_empty() {
                if self.downloader.is_completed() {
                    let report = self.downloader.report();
                    info!(
                        accounts = report.account_synced,
                        slots = report.storage_synced,
                        bytecodes = report.bytecode_synced,
                        trienodes_healed = report.trienode_heal_synced,
                        "State download complete"
                    );
                    return Ok(());
                }
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                continue;
            }

            let mut requests: JoinSet<Result<(), SyncError>> = JoinSet::new();
            for req in batch.accounts {
                let downloader = Arc::clone(&self.downloader);
                let client = Arc::clone(&self.client);
                requests.spawn(async move {
                    match client.get_account_range(&req).await {
                        Ok((response, stream)) => {
                            downloader.handle_account_request_result(req.task_id, response, &stream)
                        }
                        Err(err) => {
                            debug!(%err, task = req.task_id, "Account range request failed");
                            downloader.handle_request_error(FailedRequest::Accounts(vec![
                                req.task_id,
                            ]));
                            Ok(())
                        }
                    }
                });
            }
            if let Some(req) = batch.codes {
                let downloader = Arc::clone(&self.downloader);
                let client = Arc::clone(&self.client);
                requests.spawn(async move {
                    match client.get_byte_codes(&req.hashes, MAX_REQUEST_SIZE).await {
                        Ok((response, stream)) => downloader.handle_bytecode_request_result(
                            req.task_id,
                            req.hashes,
                            response,
                            &stream,
                        ),
                        Err(err) => {
                            debug!(%err, task = req.task_id, "Bytecode request failed");
                            downloader.handle_request_error(FailedRequest::Codes {
                                task_id: req.task_id,
                                hashes: req.hashes,
                            });
                            Ok(())
                        }
                    }
                });
            }
            if let Some(req) = batch.storages {
                let downloader = Arc::clone(&self.downloader);
                let client = Arc::clone(&self.client);
                requests.spawn(async move {
                    match client.get_storage_ranges(&req).await {
                        Ok((response, stream)) => {
                            downloader.handle_storage_request_result(req.id, response, &stream)
                        }
                        Err(err) => {
                            debug!(%err, bundle = req.id, "Storage range request failed");
                            downloader.handle_request_error(FailedRequest::Storages(req.id));
                            Ok(())
                        }
                    }
                });
            }
            if let Some(req) = batch.healtask {
                let downloader = Arc::clone(&self.downloader);
                let client = Arc::clone(&self.client);
                requests.spawn(async move {
                    match client.get_trie_nodes(&req).await {
                        Ok((response, stream)) => downloader
                            .handle_trienode_heal_request_result(req.task_id, response, &stream),
                        Err(err) => {
                            debug!(%err, task = req.task_id, "Trienode heal request failed");
                            downloader.handle_request_error(FailedRequest::TrienodeHeal(req.task_id));
                            Ok(())
                        }
                    }
                });
            }
            if let Some(req) = batch.codetask {
                let downloader = Arc::clone(&self.downloader);
                let client = Arc::clone(&self.client);
                requests.spawn(async move {
                    match client.get_byte_codes(&req.hashes, MAX_REQUEST_SIZE).await {
                        Ok((response, stream)) => downloader.handle_bytecode_heal_request_result(
                            req.task_id,
                            crate::requests::BytecodeHealResponse {
                                codes: response.codes,
                            },
                            &stream,
                        ),
                        Err(err) => {
                            debug!(%err, task = req.task_id, "Bytecode heal request failed");
                            downloader.handle_request_error(FailedRequest::BytecodeHeal(req.task_id));
                            Ok(())
                        }
                    }
                });
            }

            // Integration errors are fatal for the cycle; transport errors
            // were already rerouted into retries above.
            let mut failure = None;
            while let Some(joined) = requests.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(SyncError::UnknownTask(id))) => {
                        debug!(task = id, "Dropped response for unknown task")
                    }
                    Ok(Err(err)) => {
                        warn!(%err, "Failed to integrate state response");
                        failure.get_or_insert(err);
                    }
                    Err(err) => warn!(%err, "State sync worker panicked"),
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }
    }
}

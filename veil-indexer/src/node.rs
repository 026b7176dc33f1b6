// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Task orchestration.
//!
//! One tracker and one transfer indexer per configured chain, plus the
//! global scanner and aggregator. Every task is supervised: a task that
//! returns an error is restarted with exponential backoff, and a failure on
//! one chain never takes down the others. Clean returns (cancellation) end
//! the supervision loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::actions::UserActionAggregator;
use crate::chain_client::ChainClient;
use crate::chain_tracker::ChainTracker;
use crate::config::IndexerConfig;
use crate::error::IndexerResult;
use crate::metrics::IndexerMetrics;
use crate::scanner::AnnouncementScanner;
use crate::store::Store;
use crate::transfer_indexer::{NoPriceSource, TransferIndexer};

const RESTART_BACKOFF_INITIAL: Duration = Duration::from_millis(400);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(120);

pub struct Node {
    config: IndexerConfig,
    store: Store,
    metrics: IndexerMetrics,
}

impl Node {
    pub fn new(config: IndexerConfig, store: Store, metrics: IndexerMetrics) -> Self {
        Self {
            config,
            store,
            metrics,
        }
    }

    /// Runs until every task has exited, which happens after `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();

        for chain in &self.config.chains {
            let client = Arc::new(ChainClient::connect(
                &chain.rpc_url,
                chain.chain_id,
                self.metrics.clone(),
            )?);
            let (tip_tx, tip_rx) = watch::channel(0u64);
            let tip_tx = Arc::new(tip_tx);

            let tracker_chain = chain.clone();
            let tracker_client = client.clone();
            let tracker_store = self.store.clone();
            let tracker_metrics = self.metrics.clone();
            let tracker_cancel = cancel.clone();
            tasks.spawn(supervise(
                format!("tracker-{}", chain.chain_id),
                self.metrics.clone(),
                cancel.clone(),
                move || {
                    ChainTracker::new(
                        tracker_client.clone(),
                        tracker_store.clone(),
                        tracker_chain.clone(),
                        tracker_metrics.clone(),
                    )
                    .run(tip_tx.clone(), tracker_cancel.clone())
                },
            ));

            let indexer_chain = chain.clone();
            let indexer_store = self.store.clone();
            let indexer_metrics = self.metrics.clone();
            let indexer_cancel = cancel.clone();
            tasks.spawn(supervise(
                format!("transfer-indexer-{}", chain.chain_id),
                self.metrics.clone(),
                cancel.clone(),
                move || {
                    TransferIndexer::new(
                        client.clone(),
                        indexer_store.clone(),
                        indexer_chain.clone(),
                        indexer_metrics.clone(),
                        Arc::new(NoPriceSource),
                    )
                    .run(tip_rx.clone(), indexer_cancel.clone())
                },
            ));
        }

        let scanner_store = self.store.clone();
        let scanner_config = self.config.scanner.clone();
        let scanner_metrics = self.metrics.clone();
        let scanner_cancel = cancel.clone();
        tasks.spawn(supervise(
            "scanner".to_string(),
            self.metrics.clone(),
            cancel.clone(),
            move || {
                AnnouncementScanner::new(
                    scanner_store.clone(),
                    scanner_config.clone(),
                    scanner_metrics.clone(),
                )
                .run(scanner_cancel.clone())
            },
        ));

        let aggregator_store = self.store.clone();
        let aggregator_config = self.config.aggregator.clone();
        let aggregator_metrics = self.metrics.clone();
        let aggregator_cancel = cancel.clone();
        tasks.spawn(supervise(
            "aggregator".to_string(),
            self.metrics.clone(),
            cancel.clone(),
            move || {
                UserActionAggregator::new(
                    aggregator_store.clone(),
                    aggregator_config.clone(),
                    aggregator_metrics.clone(),
                )
                .run(aggregator_cancel.clone())
            },
        ));

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Supervised task panicked: {e:?}");
            }
        }
        info!("All tasks stopped");
        Ok(())
    }
}

/// Restarts `factory`'s task on error with exponential backoff; a clean
/// return ends supervision.
async fn supervise<F, Fut>(
    name: String,
    metrics: IndexerMetrics,
    cancel: CancellationToken,
    mut factory: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = IndexerResult<()>>,
{
    let mut delay = RESTART_BACKOFF_INITIAL;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match factory().await {
            Ok(()) => return,
            Err(e) => {
                error!("Task {name} failed, restarting in {delay:?}: {e:?}");
                metrics.task_restarts.with_label_values(&[&name]).inc();
                metrics
                    .indexer_errors
                    .with_label_values(&["supervisor", e.error_type()])
                    .inc();
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(RESTART_BACKOFF_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexerError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_supervise_restarts_until_clean_exit() {
        let metrics = IndexerMetrics::new_for_testing();
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        supervise("test".to_string(), metrics.clone(), cancel, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(IndexerError::Generic("boom".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(metrics.task_restarts.with_label_values(&["test"]).get(), 3);
    }

    #[tokio::test]
    async fn test_supervise_stops_on_cancellation() {
        let metrics = IndexerMetrics::new_for_testing();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        supervise("test".to_string(), metrics, cancel, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}

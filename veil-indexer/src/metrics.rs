// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry, HistogramVec,
    IntCounter, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const METRICS_PATH: &str = "/metrics";

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10., 30., 60., 120.,
];

#[derive(Clone, Debug)]
pub struct IndexerMetrics {
    pub(crate) last_finalized_block: IntGaugeVec,
    pub(crate) last_canonical_block: IntGaugeVec,
    pub(crate) reorgs_detected: IntCounterVec,
    pub(crate) blocks_rolled_back: IntCounterVec,

    pub(crate) cursor_height: IntGaugeVec,
    pub(crate) transfers_indexed: IntCounterVec,

    pub(crate) announcements_received: IntCounterVec,
    pub(crate) announcements_attributed: IntCounterVec,
    pub(crate) scan_view_tag_rejections: IntCounter,

    pub(crate) user_actions_created: IntCounter,
    pub(crate) user_actions_completed: IntCounter,
    pub(crate) unrecognized_action_tags: IntCounter,

    pub(crate) rpc_queries: IntCounterVec,
    pub(crate) rpc_queries_latency: HistogramVec,

    pub(crate) indexer_errors: IntCounterVec,
    pub(crate) task_restarts: IntCounterVec,
}

impl IndexerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            last_finalized_block: register_int_gauge_vec_with_registry!(
                "veil_last_finalized_block",
                "The latest finalized block observed, by chain",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            last_canonical_block: register_int_gauge_vec_with_registry!(
                "veil_last_canonical_block",
                "The highest canonical block persisted, by chain",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            reorgs_detected: register_int_counter_vec_with_registry!(
                "veil_reorgs_detected",
                "Total number of chain reorganizations repaired, by chain",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            blocks_rolled_back: register_int_counter_vec_with_registry!(
                "veil_blocks_rolled_back",
                "Total number of blocks deleted during reorg repair, by chain",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            cursor_height: register_int_gauge_vec_with_registry!(
                "veil_cursor_height",
                "Current sync cursor height per chain and category",
                &["chain_id", "category"],
                registry,
            )
            .unwrap(),
            transfers_indexed: register_int_counter_vec_with_registry!(
                "veil_transfers_indexed",
                "Total number of transfer effects written, by chain and source",
                &["chain_id", "source"],
                registry,
            )
            .unwrap(),
            announcements_received: register_int_counter_vec_with_registry!(
                "veil_announcements_received",
                "Total number of stealth announcements ingested, by chain",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            announcements_attributed: register_int_counter_vec_with_registry!(
                "veil_announcements_attributed",
                "Total number of announcements attributed to a user, by chain",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            scan_view_tag_rejections: register_int_counter_with_registry!(
                "veil_scan_view_tag_rejections",
                "Total number of announcement checks rejected by view tag alone",
                registry,
            )
            .unwrap(),
            user_actions_created: register_int_counter_with_registry!(
                "veil_user_actions_created",
                "Total number of user action groups created",
                registry,
            )
            .unwrap(),
            user_actions_completed: register_int_counter_with_registry!(
                "veil_user_actions_completed",
                "Total number of user action groups that reached their declared size",
                registry,
            )
            .unwrap(),
            unrecognized_action_tags: register_int_counter_with_registry!(
                "veil_unrecognized_action_tags",
                "Total number of transactions whose action tag failed to decode",
                registry,
            )
            .unwrap(),
            rpc_queries: register_int_counter_vec_with_registry!(
                "veil_rpc_queries",
                "Total number of queries issued to chain providers, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            rpc_queries_latency: register_histogram_vec_with_registry!(
                "veil_rpc_queries_latency",
                "Latency of queries issued to chain providers, by request type",
                &["type"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            indexer_errors: register_int_counter_vec_with_registry!(
                "veil_indexer_errors",
                "Total number of errors, by component and error type",
                &["component", "error_type"],
                registry,
            )
            .unwrap(),
            task_restarts: register_int_counter_vec_with_registry!(
                "veil_task_restarts",
                "Total number of supervised task restarts, by task",
                &["task"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

/// Serves the registry in prometheus text format until `cancel` fires.
pub fn start_metrics_server(
    addr: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let router = Router::new()
            .route(METRICS_PATH, get(metrics_handler))
            .with_state(registry);
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind metrics server on {addr}: {e:?}");
                return;
            }
        };
        info!("Metrics server listening on {addr}");
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await });
        if let Err(e) = serve.await {
            error!("Metrics server error: {e:?}");
        }
    })
}

async fn metrics_handler(State(registry): State<Registry>) -> String {
    match TextEncoder::new().encode_to_string(&registry.gather()) {
        Ok(body) => body,
        Err(e) => format!("unable to encode metrics: {e}"),
    }
}

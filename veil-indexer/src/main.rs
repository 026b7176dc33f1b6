// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;
use veil_indexer::config::IndexerConfig;
use veil_indexer::metrics::{start_metrics_server, IndexerMetrics};
use veil_indexer::node::Node;
use veil_indexer::store::Store;
use veil_indexer_pg_db::{Db, DbArgs};
use veil_indexer_schema::MIGRATIONS;

#[derive(Parser, Debug)]
#[clap(name = "veil-indexer", about = "Multi-chain wallet sync engine")]
struct Args {
    /// Path to the chain configuration file (YAML or JSON)
    #[clap(long, env = "VEIL_CONFIG_PATH")]
    config_path: PathBuf,

    #[clap(long, env = "DATABASE_URL")]
    database_url: Url,

    /// Address to serve prometheus metrics on
    #[clap(long, default_value = "0.0.0.0:9184")]
    metrics_address: SocketAddr,

    #[clap(flatten)]
    db_args: DbArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = IndexerConfig::load(&args.config_path)?;
    config.validate()?;

    let db = Db::new(args.database_url, args.db_args).await?;
    db.run_migrations(&MIGRATIONS).await?;

    let registry = Registry::new();
    let metrics = IndexerMetrics::new(&registry);
    let store = Store::new(db);

    let cancel = CancellationToken::new();
    start_metrics_server(args.metrics_address, registry, cancel.clone());
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    Node::new(config, store, metrics).run(cancel).await
}

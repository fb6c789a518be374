// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 The redkv Authors
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use clap::Parser;
use log::debug;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;

use redkv::clock::SystemClock;
use redkv::db::Db;
use redkv::metrics;
use redkv::server::Server;
use redkv::transaction::TxnCoordinator;

#[derive(Parser, Debug)]
#[command(name = "redkv", version, about = "Redis-compatible store over an ordered KV engine", long_about = None)]
struct Cli {
    /// Listen port for the RESP protocol
    #[arg(long = "port", env = "REDKV_PORT", default_value_t = 6379)]
    port: u16,

    /// Metrics port
    #[arg(long = "metrics-port", env = "REDKV_METRICS_PORT", default_value_t = 9000)]
    metrics_port: u16,

    /// Number of logical databases
    #[arg(long = "databases", env = "REDKV_DATABASES", default_value_t = 16)]
    databases: usize,

    /// Seconds between background compaction sweeps (0 disables them)
    #[arg(long = "compact-interval-secs", env = "REDKV_COMPACT_INTERVAL_SECS", default_value_t = 60)]
    compact_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let addr: SocketAddr = format!("[::]:{}", cli.port).parse()?;

    metrics::Metrics::init();

    let txn = Arc::new(TxnCoordinator::new());
    let db = Arc::new(Db::new(cli.databases, Arc::new(SystemClock), Arc::clone(&txn)));
    let server = Server::new(Arc::clone(&db), Arc::clone(&txn));

    // Build the Axum metrics app
    let metrics_app = Router::new().route("/metrics", {
        let db = Arc::clone(&db);
        let txn = Arc::clone(&txn);
        let server = Arc::clone(&server);
        get(move || {
            let db = Arc::clone(&db);
            let txn = Arc::clone(&txn);
            let server = Arc::clone(&server);
            async move {
                metrics::WATCHED_KEY_COUNT.set(txn.watched_key_count() as i64);
                metrics::KEYSPACE_RECORD_COUNT.set(db.record_count() as i64);
                metrics::CONNECTED_CLIENTS.set(server.client_count() as i64);

                let metric_families = prometheus::gather();
                let mut buf = Vec::new();
                let encoder = TextEncoder::new();
                encoder.encode(&metric_families, &mut buf).unwrap();
                String::from_utf8(buf).unwrap()
            }
        })
    });

    // Bind a listener for the metrics endpoint
    let metrics_listener = TcpListener::bind(format!("[::]:{}", cli.metrics_port)).await?;

    // Spawn the metrics server in its own task
    tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_app).await.unwrap();
    });

    // Background compaction sweep
    if cli.compact_interval_secs > 0 {
        let db = Arc::clone(&db);
        let interval = Duration::from_secs(cli.compact_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (metas, members) = db.compact();
                debug!(
                    "compaction sweep dropped {} meta and {} member records",
                    metas, members
                );
            }
        });
    }

    let listener = TcpListener::bind(addr).await?;
    println!("Starting redkv server on {}", addr);
    server.serve(listener).await?;

    Ok(())
}

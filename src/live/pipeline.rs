//! Live Ingestion Pipeline
//!
//! WebSocket header stream -> bounded queue -> consumer that spawns one
//! enrichment task per header. Shutdown is a `watch` signal: the stream stops
//! reconnecting, the consumer stops pulling, and in-flight enrichment tasks
//! run to completion.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::enrichment::{enrich_block, EnrichmentContext};
use crate::models::BlockHeader;
use crate::sources::header_stream::{HeaderStream, StreamState, StreamStats};

/// Enrichment counters.
#[derive(Debug, Default)]
pub struct EnrichmentStats {
    pub started: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub vanilla_blocks: AtomicU64,
    pub relay_blocks: AtomicU64,
    pub last_block: AtomicU64,
}

/// Point-in-time view served on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub stream_state: StreamState,
    pub headers_received: u64,
    pub headers_enqueued: u64,
    pub headers_dropped: u64,
    pub malformed_messages: u64,
    pub reconnects: u64,
    pub enrichments_started: u64,
    pub enrichments_completed: u64,
    pub enrichments_failed: u64,
    pub in_flight: u64,
    pub vanilla_blocks: u64,
    pub relay_blocks: u64,
    pub last_block: u64,
}

pub fn status_snapshot(stream: &StreamStats, enrich: &EnrichmentStats) -> PipelineStatus {
    let started = enrich.started.load(Ordering::Relaxed);
    let completed = enrich.completed.load(Ordering::Relaxed);
    let failed = enrich.failed.load(Ordering::Relaxed);
    PipelineStatus {
        stream_state: stream.state(),
        headers_received: stream.headers_received.load(Ordering::Relaxed),
        headers_enqueued: stream.headers_enqueued.load(Ordering::Relaxed),
        headers_dropped: stream.headers_dropped.load(Ordering::Relaxed),
        malformed_messages: stream.malformed_messages.load(Ordering::Relaxed),
        reconnects: stream.reconnects.load(Ordering::Relaxed),
        enrichments_started: started,
        enrichments_completed: completed,
        enrichments_failed: failed,
        in_flight: started.saturating_sub(completed + failed),
        vanilla_blocks: enrich.vanilla_blocks.load(Ordering::Relaxed),
        relay_blocks: enrich.relay_blocks.load(Ordering::Relaxed),
        last_block: enrich.last_block.load(Ordering::Relaxed),
    }
}

/// Pull headers until shutdown or until the queue closes, spawning one
/// enrichment task per header. Waits for in-flight tasks before returning.
pub async fn run_consumer(
    ctx: Arc<EnrichmentContext>,
    mut rx: mpsc::Receiver<BlockHeader>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<EnrichmentStats>,
) {
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            header = rx.recv() => {
                let Some(header) = header else {
                    info!("Header queue closed");
                    break;
                };
                let number = header.number;
                stats.started.fetch_add(1, Ordering::Relaxed);
                let ctx = ctx.clone();
                let stats = stats.clone();
                tasks.spawn(async move {
                    match enrich_block(ctx, header).await {
                        Ok(summary) => {
                            stats.completed.fetch_add(1, Ordering::Relaxed);
                            stats.last_block.fetch_max(number, Ordering::Relaxed);
                            if summary.is_vanilla {
                                stats.vanilla_blocks.fetch_add(1, Ordering::Relaxed);
                            } else {
                                stats.relay_blocks.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            error!(block = number, error = %format!("{:#}", e), "Enrichment failed");
                        }
                    }
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Enrichment task panicked");
                }
            }
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    info!("Shutdown requested, consumer stopping");
                    break;
                }
            }
        }
    }

    if !tasks.is_empty() {
        info!(in_flight = tasks.len(), "Waiting for in-flight enrichment tasks");
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Enrichment task panicked");
        }
    }
    debug!("Consumer drained");
}

async fn health() -> &'static str {
    "OK"
}

async fn status(
    State((stream, enrich)): State<(Arc<StreamStats>, Arc<EnrichmentStats>)>,
) -> Json<PipelineStatus> {
    Json(status_snapshot(&stream, &enrich))
}

pub fn status_router(stream: Arc<StreamStats>, enrich: Arc<EnrichmentStats>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state((stream, enrich))
}

async fn serve_status(
    port: u16,
    stream: Arc<StreamStats>,
    enrich: Arc<EnrichmentStats>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind status port {}", port))?;
    info!("Status server listening on port {}", port);
    axum::serve(listener, status_router(stream, enrich))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .context("Status server failed")
}

/// Wire stream, queue, consumer and status server; run until `shutdown` fires.
pub async fn run_live(
    ws_url: &str,
    ctx: Arc<EnrichmentContext>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let config = ctx.config;
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let stream = HeaderStream::new(ws_url, config, tx);
    let stream_stats = stream.stats();
    let enrich_stats = Arc::new(EnrichmentStats::default());

    if let Some(port) = config.status_port {
        let (s, e, sd) = (stream_stats.clone(), enrich_stats.clone(), shutdown.clone());
        tokio::spawn(async move {
            if let Err(err) = serve_status(port, s, e, sd).await {
                error!(error = %format!("{:#}", err), "Status server stopped");
            }
        });
    }

    info!(
        queue = config.queue_capacity,
        relays = ctx.relays.len(),
        "Live pipeline starting"
    );

    let stream_shutdown = shutdown.clone();
    let stream_task = tokio::spawn(async move { stream.run(stream_shutdown).await });

    run_consumer(ctx, rx, shutdown, enrich_stats.clone()).await;

    if let Err(e) = stream_task.await {
        error!(error = %e, "Header stream task panicked");
    }

    let final_status = status_snapshot(&stream_stats, &enrich_stats);
    info!(
        received = final_status.headers_received,
        dropped = final_status.headers_dropped,
        completed = final_status.enrichments_completed,
        failed = final_status.enrichments_failed,
        "Live pipeline stopped"
    );
    Ok(())
}

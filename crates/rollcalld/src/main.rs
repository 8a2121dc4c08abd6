use anyhow::{Context, Result};
use rollcall_core::{
    AttendanceRecorder, CacheConfig, EmbeddingCache, EmbeddingExtractor, FaceMatchingEngine,
    MatchingConfig, OnnxExtractor, RetryPolicy, RosterStore,
};
use rollcall_pairing::{BrokerConfig, RelayHub, SessionBroker};
use rollcall_store::SqliteStore;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

mod api;
mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");
    let config = Config::load()?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?,
    );
    let global = Arc::new(
        store
            .load_precomputed()
            .await
            .context("failed to load precomputed signatures")?,
    );

    let extractor: Arc<dyn EmbeddingExtractor> = Arc::new(
        OnnxExtractor::load(&config.model_dir)
            .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?,
    );
    tracing::info!(model_dir = %config.model_dir.display(), "SCRFD and ArcFace models loaded");

    let cache = Arc::new(EmbeddingCache::new(
        extractor.clone(),
        global,
        CacheConfig {
            extraction_timeout: config.extraction_timeout(),
            idle_ttl: config.cache_idle(),
        },
    ));
    let roster: Arc<dyn RosterStore> = store;
    let engine = Arc::new(FaceMatchingEngine::new(
        roster.clone(),
        extractor,
        cache.clone(),
        MatchingConfig {
            recognition_threshold: config.recognition_threshold,
            roster_retry: RetryPolicy {
                attempts: config.roster_retry_attempts,
                attempt_timeout: config.roster_timeout(),
                ..RetryPolicy::default()
            },
            extraction_timeout: config.extraction_timeout(),
        },
    ));
    let recorder = Arc::new(AttendanceRecorder::new(roster, config.archive_captures));
    if config.archive_captures {
        tracing::info!("capture archiving enabled");
    }

    let broker = Arc::new(SessionBroker::new(BrokerConfig {
        token_ttl: config.token_ttl(),
        grace: config.token_grace(),
    }));
    let relay = RelayHub::new(broker.clone());
    spawn_cache_eviction(broker.clone(), cache.clone());
    spawn_sweeper(broker.clone(), cache, config.sweep_interval());

    let state = Arc::new(api::AppState {
        broker,
        relay,
        engine,
        recorder,
        validation_timeout: config.validation_timeout(),
        started_at: Instant::now(),
    });

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "rollcalld ready");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("rollcalld shutting down");
        })
        .await?;

    Ok(())
}

/// Drop a session's embedding cache once its last live token retires.
fn spawn_cache_eviction(broker: Arc<SessionBroker>, cache: Arc<EmbeddingCache>) {
    let mut retirements = broker.subscribe();
    tokio::spawn(async move {
        loop {
            match retirements.recv().await {
                Ok(retired) => {
                    if !broker.has_live_session(&retired.session_id).await {
                        cache.evict_session(&retired.session_id);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "cache eviction fell behind; idle sweep will catch up");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_sweeper(broker: Arc<SessionBroker>, cache: Arc<EmbeddingCache>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let stats = broker.sweep().await;
            let evicted = cache.sweep_idle();
            if stats.expired + stats.evicted + evicted > 0 {
                tracing::info!(
                    expired = stats.expired,
                    forgotten = stats.evicted,
                    caches = evicted,
                    "periodic sweep"
                );
            }
        }
    });
}

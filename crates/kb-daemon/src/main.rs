use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::Parser;
use kb_auth::TokenService;
use kb_blob::{BlobStore, LocalBlobStore, RetryingBlobStore};
use kb_config::{KbConfig, ModelBackendEntry};
use kb_core::TaskKind;
use kb_daemon::{build_app, AppState};
use kb_index::{IndexStore, InMemoryIndexStore};
use kb_metadata::{InMemoryMetadataStore, MetadataStore};
use kb_models::{EmbeddingClient, HttpModelGateway, MockModelGateway, VlmClient};
use kb_pipeline::{IngestService, PipelineOrchestrator};
use kb_render::{MockOcrEngine, OcrEngine};
use kb_search::SearchOrchestrator;
use kb_tasks::{spawn_sweeper, TaskManager, WorkerPool, WorkerPoolConfig as PoolConfig};
use kb_versions::VersionManager;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kb-daemon", version, about = "Knowledge base engine HTTP control plane")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8089")]
    bind: String,

    /// Path to a TOML config file. Missing file falls back to defaults.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug { EnvFilter::new("kb=debug,info") } else { EnvFilter::new("kb=info") };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => {
            let (config, warnings) = KbConfig::load(path).with_context(|| format!("load config {}", path.display()))?;
            for warning in &warnings {
                tracing::warn!(%warning, "config warning");
            }
            config
        }
        None => KbConfig::default(),
    };

    tokio::fs::create_dir_all(&config.blob_root)
        .await
        .with_context(|| format!("create blob root {}", config.blob_root.display()))?;

    let blob: Arc<dyn BlobStore> = Arc::new(RetryingBlobStore::new(LocalBlobStore::new(&config.blob_root)));
    let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::with_default_roles().await);
    let index: Arc<dyn IndexStore> = Arc::new(InMemoryIndexStore::new());

    let embedder: Arc<dyn EmbeddingClient> = build_embedder(&config.embedding_backend);
    let vlm: Arc<dyn VlmClient> = build_vlm(&config.vlm_backend);
    let ocr: Arc<dyn OcrEngine> = Arc::new(MockOcrEngine::new(config.ocr.default_engine.clone()));

    let token_service = Arc::new(
        TokenService::new(config.token_signing_secret.as_bytes(), metadata.clone()).with_ttls(
            Duration::seconds(config.access_token_ttl_secs as i64),
            Duration::seconds(config.refresh_token_ttl_secs as i64),
        ),
    );

    let tasks = Arc::new(TaskManager::new(metadata.clone(), config.worker_pools.queue_capacity));
    let ingest = Arc::new(IngestService::new(blob.clone(), metadata.clone(), tasks.clone()));
    let search = Arc::new(SearchOrchestrator::new(index.clone(), metadata.clone(), embedder.clone(), config.hybrid_search.clone()));
    let versions = Arc::new(VersionManager::new(metadata.clone(), blob.clone(), index.clone()));

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        blob.clone(),
        metadata.clone(),
        index.clone(),
        embedder.clone(),
        vlm.clone(),
        ocr.clone(),
        config.ocr.clone(),
        ingest.clone(),
    ));

    spawn_sweeper(metadata.clone(), StdDuration::from_secs(config.worker_pools.lease_ttl_secs.max(10)));
    spawn_worker_pools(&config, metadata.clone(), orchestrator.clone());

    let state = Arc::new(AppState {
        token_service,
        metadata,
        blob,
        index,
        ingest,
        tasks,
        search,
        versions,
    });

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind).await.with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "kb-daemon listening");

    axum::serve(listener, app).await.context("serve")
}

/// Two named worker pools per spec §5: `cpu_pool` drives every stage up
/// through chunking, `model_pool` caps outbound concurrency to the embed
/// and VLM endpoints. Each pool runs a fixed number of long-lived loops
/// that poll `run_once` — an empty claim just means nothing is queued
/// right now, so the loop backs off briefly rather than busy-spinning.
fn spawn_worker_pools(config: &KbConfig, metadata: Arc<dyn MetadataStore>, orchestrator: Arc<PipelineOrchestrator>) {
    let pool_config = PoolConfig {
        concurrency: 1,
        lease_ttl: Duration::seconds(config.worker_pools.lease_ttl_secs as i64),
        heartbeat_interval: StdDuration::from_secs(config.worker_pools.heartbeat_interval_secs),
    };

    let cpu_pool = Arc::new(WorkerPool::new(
        "cpu_pool",
        pool_config,
        vec![TaskKind::IngestDocument, TaskKind::Cleanup],
        metadata.clone(),
    ));
    for worker in 0..config.worker_pools.cpu_pool_size {
        spawn_worker_loop(cpu_pool.clone(), orchestrator.clone(), worker);
    }

    let model_pool = Arc::new(WorkerPool::new("model_pool", pool_config, vec![TaskKind::ReEmbed], metadata));
    for worker in 0..config.worker_pools.model_pool_size {
        spawn_worker_loop(model_pool.clone(), orchestrator.clone(), worker);
    }
}

fn spawn_worker_loop(pool: Arc<WorkerPool>, executor: Arc<PipelineOrchestrator>, worker_index: usize) {
    tokio::spawn(async move {
        loop {
            match pool.run_once(executor.as_ref()).await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(StdDuration::from_millis(250)).await,
                Err(err) => {
                    tracing::warn!(pool = %pool.name, worker = worker_index, error = %err, "worker pool iteration failed");
                    tokio::time::sleep(StdDuration::from_millis(500)).await;
                }
            }
        }
    });
}

fn build_embedder(entry: &ModelBackendEntry) -> Arc<dyn EmbeddingClient> {
    match entry {
        ModelBackendEntry::Mock {} => Arc::new(MockModelGateway),
        ModelBackendEntry::Http { url, .. } => Arc::new(HttpModelGateway::new(url.clone(), String::new())),
    }
}

fn build_vlm(entry: &ModelBackendEntry) -> Arc<dyn VlmClient> {
    match entry {
        ModelBackendEntry::Mock {} => Arc::new(MockModelGateway),
        ModelBackendEntry::Http { url, .. } => Arc::new(HttpModelGateway::new(String::new(), url.clone())),
    }
}

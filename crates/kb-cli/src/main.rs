mod commands;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kb_auth::TokenService;
use kb_blob::{LocalBlobStore, RetryingBlobStore};
use kb_config::KbConfig;
use kb_index::InMemoryIndexStore;
use kb_metadata::{InMemoryMetadataStore, MetadataStore};
use kb_models::MockModelGateway;
use kb_pipeline::{IngestService, PipelineOrchestrator};
use kb_render::MockOcrEngine;
use kb_tasks::TaskManager;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Exit code for operator/usage errors (target not found, bad argument
/// value clap itself didn't already reject).
const EXIT_USAGE_ERROR: i32 = 2;
/// Exit code for everything else that fails.
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "kb", version, about = "Knowledge base engine operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a KbConfig TOML file; defaults to in-process reference
    /// backends when omitted.
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the index backend is reachable and ready to receive chunks.
    InitIndex,

    /// Apply storage-layout side effects not covered by config load alone.
    Migrate,

    /// Report chunks indexed under a version_id with no metadata row.
    CleanupOrphans,

    /// Synchronously re-embed and reindex one document version.
    ReindexVersion {
        /// The version's UUID.
        version_id: Uuid,
    },

    /// Revoke a user's existing tool tokens and issue a replacement.
    RotateTokens {
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("kb=debug,info")
    } else {
        EnvFilter::new("kb=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(EXIT_USAGE_ERROR);
        }
    };

    let result = match cli.command {
        Commands::InitIndex => cmd_init_index(&config).await,
        Commands::Migrate => commands::migrate(&config).await,
        Commands::CleanupOrphans => cmd_cleanup_orphans().await.map(|_| ()),
        Commands::ReindexVersion { version_id } => cmd_reindex_version(&config, version_id).await,
        Commands::RotateTokens { user } => cmd_rotate_tokens(&config, &user).await.map(|_| ()),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<KbConfig> {
    match path {
        Some(path) => {
            let (config, warnings) = KbConfig::load(path)
                .with_context(|| format!("load config {}", path.display()))?;
            for warning in &warnings {
                tracing::warn!(%warning, "config warning");
            }
            Ok(config)
        }
        None => Ok(KbConfig::default()),
    }
}

async fn cmd_init_index(config: &KbConfig) -> Result<()> {
    let index = InMemoryIndexStore::new();
    commands::init_index(config, &index).await
}

async fn cmd_cleanup_orphans() -> Result<Vec<Uuid>> {
    let metadata = InMemoryMetadataStore::with_default_roles().await;
    let index = InMemoryIndexStore::new();
    commands::cleanup_orphans(&metadata, &index).await
}

async fn cmd_reindex_version(config: &KbConfig, version_id: Uuid) -> Result<()> {
    tokio::fs::create_dir_all(&config.blob_root)
        .await
        .with_context(|| format!("create blob root {}", config.blob_root.display()))?;

    let blob = Arc::new(RetryingBlobStore::new(LocalBlobStore::new(&config.blob_root)));
    let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::with_default_roles().await);
    let index = Arc::new(InMemoryIndexStore::new());
    let embedder = Arc::new(MockModelGateway);
    let vlm = Arc::new(MockModelGateway);
    let ocr = Arc::new(MockOcrEngine::new(config.ocr.default_engine.clone()));

    let tasks = Arc::new(TaskManager::new(metadata.clone(), config.worker_pools.queue_capacity));
    let ingest = Arc::new(IngestService::new(blob.clone(), metadata.clone(), tasks.clone()));
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        blob, metadata.clone(), index, embedder, vlm, ocr, config.ocr.clone(), ingest,
    ));

    commands::reindex_version(tasks, metadata, orchestrator, version_id).await
}

async fn cmd_rotate_tokens(config: &KbConfig, username: &str) -> Result<String> {
    let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::with_default_roles().await);
    let tokens = TokenService::new(config.token_signing_secret.as_bytes(), metadata.clone());
    commands::rotate_tokens(metadata, &tokens, username).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_configured_index_hosts() {
        let config = KbConfig::default();
        assert!(config.index_hosts.is_empty());
    }
}

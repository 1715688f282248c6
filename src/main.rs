//! Server Bootstrap
//!
//! Initializes logging, storage, and the model provider, then parks. The
//! HTTP/API layer is an external collaborator; this binary exists to run the
//! execution core standalone (e.g. under an embedding process or for local
//! smoke testing).

use std::sync::Arc;

use anyhow::{Context, Result};
use plandex_llm::OpenAiCompatProvider;
use plandex_server::storage::Database;
use plandex_server::utils::paths;
use plandex_server::ServerState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let base_dir = paths::default_base_dir();
    std::fs::create_dir_all(&base_dir)
        .with_context(|| format!("creating base dir {}", base_dir.display()))?;

    let db = Database::new(&base_dir.join("server.db")).context("opening lock database")?;

    let api_base = std::env::var("PLANDEX_MODEL_API_BASE")
        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let api_key = std::env::var("PLANDEX_MODEL_API_KEY").unwrap_or_default();
    let provider = Arc::new(OpenAiCompatProvider::new(api_base, api_key));

    let state = ServerState::new(&base_dir, db, provider);

    // leftover locks from a previous run are stale by definition
    let reaped = state.lock_store.cleanup_all().unwrap_or(0);
    if reaped > 0 {
        tracing::info!(reaped, "cleaned up stale repo locks");
    }

    tracing::info!(base_dir = %state.base_dir().display(), "plan execution core ready");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down, releasing locks");
    state.lock_store.cleanup_all().ok();

    Ok(())
}

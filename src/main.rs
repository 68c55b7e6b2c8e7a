//! rig-coder HTTP service
//!
//! Configuration comes from the environment (see `Config::from_env`);
//! `DEEPSEEK_API_KEY` is required.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rig_coder::server::{self, AppState};
use rig_coder::{Config, DeepSeekClient};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {e}"))?;

    info!("🚀 Starting rig-coder");
    info!(
        "Config: model={}, retrieval={}, data_dir={}, test_command={:?}",
        config.chat_model,
        config.retrieval,
        config.data_dir.display(),
        config.test_command
    );

    let client = DeepSeekClient::from_env()?.with_model(&config.chat_model);
    let state = AppState::new(config, Arc::new(client))?;
    server::serve(state).await
}

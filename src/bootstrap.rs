// src/bootstrap.rs
//! Composition root: turns a validated [`AppConfig`] into live collaborators.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::analyze::ai_adapter::build_client_from_config;
use crate::clock::SystemClock;
use crate::config::{AppConfig, StoreConfig};
use crate::ingest::parser::XmlFeedParser;
use crate::ingest::transport::ReqwestTransport;
use crate::notify::build_sink;
use crate::pipeline::{Collaborators, Pipeline};
use crate::store::{MemoryStore, SqliteStore, Store};

pub async fn build_store(cfg: &StoreConfig) -> Result<Arc<dyn Store>> {
    match cfg.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        _ => {
            let store = SqliteStore::connect(&cfg.path)
                .await
                .with_context(|| format!("opening store {}", cfg.path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

pub async fn build_pipeline(cfg: &AppConfig) -> Result<Pipeline> {
    let store = build_store(&cfg.store).await?;
    let transport = ReqwestTransport::new(&cfg.runner.user_agent, cfg.runner.max_body_bytes)?;
    let ai = build_client_from_config(&cfg.ai)?;
    let sink = build_sink(&cfg.publish)?;

    // Safe diagnostics: provider, model and sink only; never the key.
    info!(
        provider = ai.provider_name(),
        model = %cfg.ai.model,
        sink = sink.name(),
        feeds = cfg.feeds.len(),
        "pipeline configured"
    );

    Pipeline::new(
        Collaborators {
            store,
            clock: Arc::new(SystemClock),
            transport: Arc::new(transport),
            parser: Arc::new(XmlFeedParser),
            ai,
            sink,
        },
        cfg,
    )
}

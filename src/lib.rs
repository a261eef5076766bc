// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod analyze;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod error;
pub mod ingest;
pub mod keyed_lock;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod repo;
pub mod store;

// ---- Re-exports for a stable public API ----
pub use analyze::ai_adapter;
pub use config::{load_config, AppConfig, FeedConfig, RawFeedConfig};
pub use error::{AiParseError, ConfigError, FetchError, PublishError, StoreError};
pub use pipeline::{Pipeline, RunReport};

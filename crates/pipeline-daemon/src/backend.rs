//! Storage backend selection

use crate::config::StorageConfig;
use crate::error::DaemonResult;
use pipeline_store::{InMemoryPipelineStore, PipelineStore};
use std::sync::Arc;

/// Open the configured store. PostgreSQL stores create their schema on
/// connect.
pub async fn open_store(config: &StorageConfig) -> DaemonResult<Arc<dyn PipelineStore>> {
    match config {
        StorageConfig::Memory => {
            tracing::info!("Using in-memory storage");
            Ok(Arc::new(InMemoryPipelineStore::new()))
        }
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
            lock_timeout_ms,
        } => {
            let store = pipeline_store::postgres::PostgresPipelineStore::connect_with_options(
                url,
                *max_connections,
                *connect_timeout_secs,
                *lock_timeout_ms,
            )
            .await?;
            tracing::info!(max_connections, lock_timeout_ms, "Connected to PostgreSQL");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(crate::error::DaemonError::Config(
            "postgres storage requires the `postgres` feature".to_string(),
        )),
    }
}

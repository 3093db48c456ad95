//! Pipeline daemon library
//!
//! Components behind the `pipelinectl` binary:
//! - layered configuration
//! - storage backend selection
//! - the periodic aggregate refresher

pub mod backend;
pub mod config;
pub mod error;
pub mod scheduler;

pub use backend::open_store;
pub use config::{PipelineConfig, StorageConfig};
pub use error::{DaemonError, DaemonResult};
pub use scheduler::AggregateRefresher;

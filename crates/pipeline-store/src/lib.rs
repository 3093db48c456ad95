//! Storage contracts for the sales/project pipeline.
//!
//! Every read and write takes a [`TenantScope`](pipeline_types::TenantScope);
//! rows outside the scope behave exactly like missing rows. Backends:
//! - [`memory::InMemoryPipelineStore`] for tests and single-process use
//! - `postgres::PostgresPipelineStore` (feature `postgres`) as the
//!   transactional source of truth

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryPipelineStore;
pub use model::{OfferPricing, OfferWin, ProjectWin, WinReceipt};
pub use traits::{
    AggregateStore, OfferStore, PipelineStore, ProjectStore, SequenceStore, WorkflowStore,
};

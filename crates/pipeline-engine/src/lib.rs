//! Workflows of the sales pipeline.
//!
//! [`PipelineEngine`] wires together:
//! - [`SequenceAllocator`]: gap-free per-(company, year) counters
//! - [`DocumentNumbering`]: `PREFIX-YEAR-NNN` numbers with transient retry
//! - [`OfferLifecycle`]: the offer phase machine and the win workflow
//! - [`ProjectLifecycle`]: best-offer economics, manual phases, health
//! - [`PipelineAggregator`]: dashboard totals without double counting
//!
//! Every operation takes a [`TenantScope`](pipeline_types::TenantScope);
//! records outside it behave as if they did not exist.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod aggregation;
mod engine;
mod error;
mod numbering;
mod offers;
mod projects;
mod retry;
mod sequence;

pub use aggregation::{OfferStats, PipelineAggregator, WinRateStats};
pub use engine::{EngineSettings, PipelineEngine};
pub use error::{EngineError, EngineResult};
pub use numbering::DocumentNumbering;
pub use offers::{OfferLifecycle, TransitionMetadata, TransitionOutcome};
pub use projects::{infer_customer, HealthReport, ProjectLifecycle};
pub use retry::RetryPolicy;
pub use sequence::SequenceAllocator;

//! Domain types for the multi-tenant sales/project pipeline.
//!
//! This crate holds no I/O. It defines:
//! - tenant identity and query scoping
//! - offers, projects and their phase machines
//! - document number formatting
//! - the no-double-count pipeline fold shared by every storage backend

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
mod ids;
mod numbering;
mod offer;
mod pipeline;
mod project;
mod tenant;

pub use error::{DomainError, DomainResult};
pub use ids::{BudgetItemId, CustomerId, OfferId, ProjectId, UserId};
pub use numbering::{format_document_number, has_win_suffix, SequenceCounter, DEFAULT_WIN_SUFFIX};
pub use offer::{
    weighted_value, LossReasonCategory, NewOffer, Offer, OfferPhase, OfferPhaseChange,
    OFFER_VALIDITY_DAYS,
};
pub use pipeline::{
    aggregate_by_company, merge_phases, DateRange, MaterializedPipelineRow, PhaseTotals,
    PipelineOfferRow, PipelinePhaseStats,
};
pub use project::{
    BudgetItem, BudgetParent, CustomerUpdate, NewProject, Project, ProjectEconomics,
    ProjectHealth, ProjectPhase, WinningOffer,
};
pub use tenant::{Caller, CompanyDirectory, CompanyId, TenantScope};

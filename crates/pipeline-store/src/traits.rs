use crate::model::{OfferPricing, OfferWin, WinReceipt};
use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_types::{
    BudgetItem, BudgetParent, CompanyId, DateRange, MaterializedPipelineRow, Offer, OfferId,
    OfferPhaseChange, OfferPhase, PipelineOfferRow, Project, ProjectEconomics, ProjectId,
    ProjectPhase, SequenceCounter, TenantScope, WinningOffer,
};

/// Per-(company, year) document counters.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Issue the next value atomically. The first call for a key returns 1.
    async fn next_sequence_value(&self, company: &CompanyId, year: i32) -> StorageResult<u64>;

    /// Raise the counter to at least `value` and return the resulting value.
    /// Never lowers it. Creates the counter when missing.
    async fn raise_sequence_floor(
        &self,
        company: &CompanyId,
        year: i32,
        value: u64,
    ) -> StorageResult<u64>;

    /// Last issued value, 0 when the counter does not exist.
    async fn current_sequence_value(&self, company: &CompanyId, year: i32) -> StorageResult<u64>;

    /// Counters ordered by company ascending, then year descending.
    async fn list_sequences(&self, scope: &TenantScope) -> StorageResult<Vec<SequenceCounter>>;
}

/// Offer records.
#[async_trait]
pub trait OfferStore: Send + Sync {
    /// Insert a new offer. Number and external reference collisions within the
    /// company are `Conflict`.
    async fn insert_offer(&self, offer: &Offer) -> StorageResult<()>;

    async fn get_offer(&self, scope: &TenantScope, id: OfferId) -> StorageResult<Option<Offer>>;

    /// Offers linked to a project, highest value first, then lowest id.
    async fn list_project_offers(
        &self,
        scope: &TenantScope,
        project_id: ProjectId,
    ) -> StorageResult<Vec<Offer>>;

    async fn offer_number_exists(
        &self,
        company: &CompanyId,
        number: &str,
        exclude: Option<OfferId>,
    ) -> StorageResult<bool>;

    /// Empty references never exist.
    async fn external_reference_exists(
        &self,
        company: &CompanyId,
        reference: &str,
        exclude: Option<OfferId>,
    ) -> StorageResult<bool>;

    async fn update_offer_pricing(
        &self,
        scope: &TenantScope,
        id: OfferId,
        pricing: OfferPricing,
    ) -> StorageResult<Offer>;

    async fn set_offer_number(
        &self,
        scope: &TenantScope,
        id: OfferId,
        number: &str,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<Offer>;

    async fn set_external_reference(
        &self,
        scope: &TenantScope,
        id: OfferId,
        reference: Option<&str>,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<Offer>;

    /// Link to, or with `None` unlink from, a project of the same company.
    async fn set_offer_project(
        &self,
        scope: &TenantScope,
        id: OfferId,
        project_id: Option<ProjectId>,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<Offer>;

    /// Apply `change` only if the offer is still in `expected_from`.
    async fn transition_offer(
        &self,
        scope: &TenantScope,
        id: OfferId,
        expected_from: OfferPhase,
        change: &OfferPhaseChange,
    ) -> StorageResult<Offer>;

    /// Concatenate `suffix` onto the assigned number. Not idempotent.
    async fn append_offer_number_suffix(
        &self,
        scope: &TenantScope,
        id: OfferId,
        suffix: &str,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<String>;

    /// Expire every active offer of `project_id` other than `winner` in one
    /// statement. Returns the ids that changed.
    async fn expire_sibling_offers(
        &self,
        scope: &TenantScope,
        project_id: ProjectId,
        winner: OfferId,
        at: DateTime<Utc>,
    ) -> StorageResult<Vec<OfferId>>;

    /// Pipeline-phase offers created inside `range`.
    async fn list_pipeline_offers(
        &self,
        scope: &TenantScope,
        range: &DateRange,
    ) -> StorageResult<Vec<PipelineOfferRow>>;
}

/// Project records and their budget lines.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn insert_project(&self, project: &Project) -> StorageResult<()>;

    async fn get_project(
        &self,
        scope: &TenantScope,
        id: ProjectId,
    ) -> StorageResult<Option<Project>>;

    /// Write best-offer economics. Returns `false` without writing when the
    /// project has left `tilbud`.
    async fn update_project_economics(
        &self,
        scope: &TenantScope,
        id: ProjectId,
        economics: &ProjectEconomics,
    ) -> StorageResult<bool>;

    /// Promote a bidding project with no winner yet. A project that already
    /// has a winner is `Conflict`.
    async fn set_winning_offer(
        &self,
        scope: &TenantScope,
        id: ProjectId,
        winner: &WinningOffer,
    ) -> StorageResult<Project>;

    async fn change_project_phase(
        &self,
        scope: &TenantScope,
        id: ProjectId,
        expected_from: ProjectPhase,
        to: ProjectPhase,
        at: DateTime<Utc>,
    ) -> StorageResult<Project>;

    async fn insert_budget_item(&self, item: &BudgetItem) -> StorageResult<()>;

    async fn list_budget_items(
        &self,
        scope: &TenantScope,
        parent: BudgetParent,
    ) -> StorageResult<Vec<BudgetItem>>;
}

/// Multi-record workflows that must commit or fail as a unit.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Move the offer to `order`, promote its project and expire its
    /// siblings in one transaction.
    async fn commit_offer_win(&self, scope: &TenantScope, win: &OfferWin)
        -> StorageResult<WinReceipt>;
}

/// Precomputed dashboard aggregate.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Recompute the aggregate from current offers. Returns the row count.
    async fn refresh_pipeline_aggregate(&self) -> StorageResult<usize>;

    async fn materialized_pipeline_rows(
        &self,
        scope: &TenantScope,
    ) -> StorageResult<Vec<MaterializedPipelineRow>>;
}

/// Convenience trait for backends implementing every pipeline store.
pub trait PipelineStore:
    SequenceStore + OfferStore + ProjectStore + WorkflowStore + AggregateStore + Send + Sync
{
}

impl<T> PipelineStore for T where
    T: SequenceStore + OfferStore + ProjectStore + WorkflowStore + AggregateStore + Send + Sync
{
}

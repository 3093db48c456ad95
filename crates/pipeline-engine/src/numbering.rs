//! Document numbers (`PREFIX-YEAR-NNN`) and their per-tenant uniqueness.

use crate::error::{EngineError, EngineResult};
use crate::retry::RetryPolicy;
use crate::sequence::SequenceAllocator;
use chrono::{Datelike, Utc};
use pipeline_store::PipelineStore;
use pipeline_types::{format_document_number, CompanyDirectory, CompanyId, OfferId, TenantScope};
use std::sync::Arc;

/// Formats allocator output into document numbers.
///
/// Offers and projects draw from the same (company, year) counter.
pub struct DocumentNumbering {
    allocator: SequenceAllocator,
    store: Arc<dyn PipelineStore>,
    directory: CompanyDirectory,
    retry: RetryPolicy,
    win_suffix: String,
}

impl DocumentNumbering {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        directory: CompanyDirectory,
        retry: RetryPolicy,
        win_suffix: impl Into<String>,
    ) -> Self {
        Self {
            allocator: SequenceAllocator::new(store.clone()),
            store,
            directory,
            retry,
            win_suffix: win_suffix.into(),
        }
    }

    pub fn allocator(&self) -> &SequenceAllocator {
        &self.allocator
    }

    pub fn directory(&self) -> &CompanyDirectory {
        &self.directory
    }

    pub fn win_suffix(&self) -> &str {
        &self.win_suffix
    }

    /// Next number for `company` in the current calendar year.
    pub async fn generate_number(&self, company: &CompanyId) -> EngineResult<String> {
        self.generate_number_for_year(company, Utc::now().year()).await
    }

    /// Next number for `company` in `year`. Transient allocation failures are
    /// retried with backoff; a number is never skipped or issued twice.
    pub async fn generate_number_for_year(
        &self,
        company: &CompanyId,
        year: i32,
    ) -> EngineResult<String> {
        let prefix = self
            .directory
            .prefix(company)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown company {company}")))?;
        let allocator = &self.allocator;
        let sequence = self
            .retry
            .run("sequence allocation", move || allocator.next(company, year))
            .await?;
        let number = format_document_number(prefix, year, sequence);
        tracing::info!(
            number = %number,
            company = %company,
            year,
            sequence,
            "Generated document number"
        );
        Ok(number)
    }

    pub async fn generate_offer_number(&self, company: &CompanyId) -> EngineResult<String> {
        let number = self.generate_number(company).await?;
        tracing::debug!(number = %number, entity = "offer", "Assigned number");
        Ok(number)
    }

    pub async fn generate_project_number(&self, company: &CompanyId) -> EngineResult<String> {
        let number = self.generate_number(company).await?;
        tracing::debug!(number = %number, entity = "project", "Assigned number");
        Ok(number)
    }

    /// Whether `candidate` is free in `company`, ignoring offer `exclude`.
    pub async fn check_unique(
        &self,
        candidate: &str,
        company: &CompanyId,
        exclude: Option<OfferId>,
    ) -> EngineResult<bool> {
        Ok(!self
            .store
            .offer_number_exists(company, candidate, exclude)
            .await?)
    }

    /// Whether an external reference is free. Empty references always are.
    pub async fn check_external_reference_unique(
        &self,
        reference: &str,
        company: &CompanyId,
        exclude: Option<OfferId>,
    ) -> EngineResult<bool> {
        if reference.is_empty() {
            return Ok(true);
        }
        Ok(!self
            .store
            .external_reference_exists(company, reference, exclude)
            .await?)
    }

    /// Concatenate `suffix` onto an assigned offer number.
    ///
    /// Not idempotent: calling twice appends twice, so this is never retried.
    pub async fn append_win_suffix(
        &self,
        scope: &TenantScope,
        offer_id: OfferId,
        suffix: &str,
    ) -> EngineResult<String> {
        let number = self
            .store
            .append_offer_number_suffix(scope, offer_id, suffix, Utc::now())
            .await?;
        tracing::info!(offer_id = %offer_id, number = %number, "Appended suffix to offer number");
        Ok(number)
    }
}

use crate::error::EngineResult;
use pipeline_store::PipelineStore;
use pipeline_types::{CompanyId, SequenceCounter, TenantScope};
use std::sync::Arc;

/// Issues per-(company, year) sequence values.
///
/// Transient lock failures are returned, not retried; callers decide on
/// backoff.
#[derive(Clone)]
pub struct SequenceAllocator {
    store: Arc<dyn PipelineStore>,
}

impl SequenceAllocator {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// Next value for `(company, year)`. The first value is 1.
    pub async fn next(&self, company: &CompanyId, year: i32) -> EngineResult<u64> {
        let value = self.store.next_sequence_value(company, year).await?;
        tracing::debug!(company = %company, year, sequence = value, "Allocated sequence value");
        Ok(value)
    }

    /// Raise the counter to at least `value`. Lower values are a no-op.
    /// Returns the counter after the call.
    pub async fn set_floor(&self, company: &CompanyId, year: i32, value: u64) -> EngineResult<u64> {
        let before = self.store.current_sequence_value(company, year).await?;
        let after = self.store.raise_sequence_floor(company, year, value).await?;
        if after > before {
            tracing::info!(
                company = %company,
                year,
                from = before,
                to = after,
                "Raised sequence floor"
            );
        } else {
            tracing::debug!(
                company = %company,
                year,
                current = after,
                requested = value,
                "Sequence floor unchanged"
            );
        }
        Ok(after)
    }

    /// Last issued value, 0 if nothing was issued yet.
    pub async fn current(&self, company: &CompanyId, year: i32) -> EngineResult<u64> {
        Ok(self.store.current_sequence_value(company, year).await?)
    }

    pub async fn list(&self, scope: &TenantScope) -> EngineResult<Vec<SequenceCounter>> {
        Ok(self.store.list_sequences(scope).await?)
    }
}

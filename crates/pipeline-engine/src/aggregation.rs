//! Dashboard pipeline statistics.
//!
//! Two paths produce the same numbers: the stored aggregate, refreshed
//! periodically, and an on-demand fold over raw offer rows used whenever a
//! date range narrows the query.

use crate::error::EngineResult;
use pipeline_store::PipelineStore;
use pipeline_types::{
    aggregate_by_company, merge_phases, weighted_value, DateRange, OfferPhase, PipelineOfferRow,
    PipelinePhaseStats, TenantScope,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Offer-level totals over the pipeline phases. Every offer counts; there is
/// no per-project grouping here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferStats {
    pub total_offers: u64,
    pub total_value: Decimal,
    pub weighted_value: Decimal,
    /// Offers still being decided (`in_progress` and `sent`).
    pub reserve_offers: u64,
    pub reserve_value: Decimal,
    pub reserve_weighted_value: Decimal,
    /// Mean probability of reserve offers, zero when there are none.
    pub average_reserve_probability: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinRateStats {
    pub won_count: u64,
    pub won_value: Decimal,
    pub lost_count: u64,
    pub lost_value: Decimal,
    /// `won / (won + lost)` by count, as a fraction.
    pub win_rate: Decimal,
    /// `won / (won + lost)` by value, as a fraction.
    pub value_win_rate: Decimal,
}

pub struct PipelineAggregator {
    store: Arc<dyn PipelineStore>,
}

impl PipelineAggregator {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// Per-phase pipeline totals for the caller's scope.
    ///
    /// Without a date bound the stored aggregate is read; with one, the
    /// totals are computed from raw offers.
    pub async fn aggregated_pipeline_stats(
        &self,
        scope: &TenantScope,
        range: Option<DateRange>,
    ) -> EngineResult<Vec<PipelinePhaseStats>> {
        match range {
            Some(range) if !range.is_unbounded() => self.raw_pipeline_stats(scope, &range).await,
            _ => self.materialized_pipeline_stats(scope).await,
        }
    }

    pub async fn materialized_pipeline_stats(
        &self,
        scope: &TenantScope,
    ) -> EngineResult<Vec<PipelinePhaseStats>> {
        let rows = self.store.materialized_pipeline_rows(scope).await?;
        Ok(merge_phases(&rows))
    }

    pub async fn raw_pipeline_stats(
        &self,
        scope: &TenantScope,
        range: &DateRange,
    ) -> EngineResult<Vec<PipelinePhaseStats>> {
        let offers = self.store.list_pipeline_offers(scope, range).await?;
        let rows = aggregate_by_company(&offers);
        Ok(merge_phases(&rows))
    }

    /// Recompute the stored aggregate from current offers.
    pub async fn refresh(&self) -> EngineResult<usize> {
        let rows = self.store.refresh_pipeline_aggregate().await?;
        tracing::debug!(rows, "Refreshed pipeline aggregate");
        Ok(rows)
    }

    pub async fn offer_stats(
        &self,
        scope: &TenantScope,
        range: &DateRange,
    ) -> EngineResult<OfferStats> {
        let offers = self.store.list_pipeline_offers(scope, range).await?;
        Ok(offer_stats(&offers))
    }

    pub async fn win_rate(
        &self,
        scope: &TenantScope,
        range: &DateRange,
    ) -> EngineResult<WinRateStats> {
        let offers = self.store.list_pipeline_offers(scope, range).await?;
        Ok(win_rate(&offers))
    }
}

fn offer_stats(rows: &[PipelineOfferRow]) -> OfferStats {
    let mut stats = OfferStats::default();
    let mut probability_sum = 0u64;
    for row in rows.iter().filter(|r| r.phase.is_pipeline()) {
        let weighted = weighted_value(row.value, row.probability);
        stats.total_offers += 1;
        stats.total_value += row.value;
        stats.weighted_value += weighted;
        if row.phase.is_reserve() {
            stats.reserve_offers += 1;
            stats.reserve_value += row.value;
            stats.reserve_weighted_value += weighted;
            probability_sum += u64::from(row.probability);
        }
    }
    if stats.reserve_offers > 0 {
        stats.average_reserve_probability =
            (Decimal::from(probability_sum) / Decimal::from(stats.reserve_offers)).round_dp(2);
    }
    stats
}

fn win_rate(rows: &[PipelineOfferRow]) -> WinRateStats {
    let mut stats = WinRateStats::default();
    for row in rows {
        if row.phase.is_won() {
            stats.won_count += 1;
            stats.won_value += row.value;
        } else if row.phase == OfferPhase::Lost {
            stats.lost_count += 1;
            stats.lost_value += row.value;
        }
    }
    stats.win_rate = ratio(
        Decimal::from(stats.won_count),
        Decimal::from(stats.won_count + stats.lost_count),
    );
    stats.value_win_rate = ratio(stats.won_value, stats.won_value + stats.lost_value);
    stats
}

fn ratio(part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        Decimal::ZERO
    } else {
        (part / whole).round_dp(4)
    }
}

//! Dashboard pipeline rows and the grouping fold behind them.
//!
//! Offers linked to the same project in the same phase form one group and
//! are represented by their highest-value offer (lowest ID on ties). An offer
//! without a project is a group of its own. Totals are summed over group
//! representatives, so competing offers for one project never inflate the
//! pipeline.

use crate::ids::{OfferId, ProjectId};
use crate::offer::{weighted_value, Offer, OfferPhase};
use crate::tenant::CompanyId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Inclusive creation-time window. Open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

/// The slice of an offer the aggregation reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOfferRow {
    pub id: OfferId,
    pub company_id: CompanyId,
    pub project_id: Option<ProjectId>,
    pub phase: OfferPhase,
    pub value: Decimal,
    pub probability: u8,
    pub created_at: DateTime<Utc>,
}

impl From<&Offer> for PipelineOfferRow {
    fn from(offer: &Offer) -> Self {
        Self {
            id: offer.id,
            company_id: offer.company_id.clone(),
            project_id: offer.project_id,
            phase: offer.phase,
            value: offer.value,
            probability: offer.probability,
            created_at: offer.created_at,
        }
    }
}

/// Summed counts and values for one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTotals {
    pub project_count: u64,
    pub offer_count: u64,
    pub total_value: Decimal,
    pub weighted_value: Decimal,
}

impl PhaseTotals {
    fn absorb(&mut self, other: &PhaseTotals) {
        self.project_count += other.project_count;
        self.offer_count += other.offer_count;
        self.total_value += other.total_value;
        self.weighted_value += other.weighted_value;
    }
}

/// A stored (company, phase) aggregate row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedPipelineRow {
    pub company_id: CompanyId,
    pub phase: OfferPhase,
    pub totals: PhaseTotals,
}

/// Dashboard output for one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePhaseStats {
    pub phase: OfferPhase,
    #[serde(flatten)]
    pub totals: PhaseTotals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    Project(ProjectId),
    Orphan(OfferId),
}

struct Group {
    representative: OfferId,
    value: Decimal,
    probability: u8,
    offers: u64,
}

impl Group {
    fn consider(&mut self, row: &PipelineOfferRow) {
        self.offers += 1;
        let better = row.value > self.value
            || (row.value == self.value && row.id < self.representative);
        if better {
            self.representative = row.id;
            self.value = row.value;
            self.probability = row.probability;
        }
    }
}

/// Fold offer rows into per-(company, phase) totals.
///
/// Rows outside the pipeline phases are ignored.
pub fn aggregate_by_company<'a, I>(rows: I) -> Vec<MaterializedPipelineRow>
where
    I: IntoIterator<Item = &'a PipelineOfferRow>,
{
    let mut groups: BTreeMap<(CompanyId, OfferPhase, GroupKey), Group> = BTreeMap::new();
    for row in rows.into_iter().filter(|r| r.phase.is_pipeline()) {
        let key = match row.project_id {
            Some(project) => GroupKey::Project(project),
            None => GroupKey::Orphan(row.id),
        };
        groups
            .entry((row.company_id.clone(), row.phase, key))
            .and_modify(|g| g.consider(row))
            .or_insert_with(|| Group {
                representative: row.id,
                value: row.value,
                probability: row.probability,
                offers: 1,
            });
    }

    let mut totals: BTreeMap<(CompanyId, OfferPhase), PhaseTotals> = BTreeMap::new();
    for ((company, phase, _), group) in groups {
        let t = totals.entry((company, phase)).or_default();
        t.project_count += 1;
        t.offer_count += group.offers;
        t.total_value += group.value;
        t.weighted_value += weighted_value(group.value, group.probability);
    }

    totals
        .into_iter()
        .map(|((company_id, phase), totals)| MaterializedPipelineRow {
            company_id,
            phase,
            totals,
        })
        .collect()
}

/// Merge company rows into one entry per pipeline phase, in phase order.
///
/// Phases without rows are reported with zero totals.
pub fn merge_phases<'a, I>(rows: I) -> Vec<PipelinePhaseStats>
where
    I: IntoIterator<Item = &'a MaterializedPipelineRow>,
{
    let mut by_phase: BTreeMap<OfferPhase, PhaseTotals> = OfferPhase::PIPELINE
        .into_iter()
        .map(|p| (p, PhaseTotals::default()))
        .collect();
    for row in rows {
        if let Some(t) = by_phase.get_mut(&row.phase) {
            t.absorb(&row.totals);
        }
    }
    by_phase
        .into_iter()
        .map(|(phase, totals)| PipelinePhaseStats { phase, totals })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn row(id: u128, project: Option<u128>, phase: OfferPhase, value: Decimal, p: u8) -> PipelineOfferRow {
        PipelineOfferRow {
            id: OfferId::from_uuid(Uuid::from_u128(id)),
            company_id: CompanyId::new("acme"),
            project_id: project.map(|p| ProjectId::from_uuid(Uuid::from_u128(p))),
            phase,
            value,
            probability: p,
            created_at: Utc::now(),
        }
    }

    fn phase_totals(stats: &[PipelinePhaseStats], phase: OfferPhase) -> PhaseTotals {
        stats
            .iter()
            .find(|s| s.phase == phase)
            .map(|s| s.totals.clone())
            .unwrap_or_default()
    }

    #[test]
    fn test_competing_offers_count_once() {
        let rows = vec![
            row(1, Some(10), OfferPhase::Sent, dec!(100), 10),
            row(2, Some(10), OfferPhase::Sent, dec!(200), 20),
            row(3, Some(10), OfferPhase::Sent, dec!(300), 50),
        ];
        let stats = merge_phases(&aggregate_by_company(&rows));
        let sent = phase_totals(&stats, OfferPhase::Sent);
        assert_eq!(sent.total_value, dec!(300));
        assert_eq!(sent.weighted_value, dec!(150));
        assert_eq!(sent.project_count, 1);
        assert_eq!(sent.offer_count, 3);
    }

    #[test]
    fn test_tie_uses_lowest_offer_id() {
        let rows = vec![
            row(7, Some(10), OfferPhase::Sent, dec!(500), 90),
            row(3, Some(10), OfferPhase::Sent, dec!(500), 10),
        ];
        let stats = merge_phases(&aggregate_by_company(&rows));
        assert_eq!(phase_totals(&stats, OfferPhase::Sent).weighted_value, dec!(50));
    }

    #[test]
    fn test_orphans_are_their_own_group() {
        let rows = vec![
            row(1, None, OfferPhase::InProgress, dec!(100), 50),
            row(2, None, OfferPhase::InProgress, dec!(40), 50),
        ];
        let stats = merge_phases(&aggregate_by_company(&rows));
        let t = phase_totals(&stats, OfferPhase::InProgress);
        assert_eq!(t.project_count, 2);
        assert_eq!(t.offer_count, 2);
        assert_eq!(t.total_value, dec!(140));
        assert_eq!(t.weighted_value, dec!(70));
    }

    #[test]
    fn test_draft_and_expired_are_excluded() {
        let rows = vec![
            row(1, None, OfferPhase::Draft, dec!(100), 50),
            row(2, None, OfferPhase::Expired, dec!(100), 50),
        ];
        assert!(aggregate_by_company(&rows).is_empty());
        let stats = merge_phases(&aggregate_by_company(&rows));
        assert_eq!(stats.len(), OfferPhase::PIPELINE.len());
        assert!(stats.iter().all(|s| s.totals == PhaseTotals::default()));
    }

    #[test]
    fn test_same_project_in_two_phases_counts_in_each() {
        let rows = vec![
            row(1, Some(10), OfferPhase::Sent, dec!(100), 50),
            row(2, Some(10), OfferPhase::Lost, dec!(80), 0),
        ];
        let stats = merge_phases(&aggregate_by_company(&rows));
        assert_eq!(phase_totals(&stats, OfferPhase::Sent).project_count, 1);
        assert_eq!(phase_totals(&stats, OfferPhase::Lost).project_count, 1);
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let at = Utc::now();
        assert!(DateRange::between(at, at).contains(at));
        assert!(DateRange::default().is_unbounded());
        assert!(!DateRange {
            from: Some(at),
            to: None
        }
        .contains(at - chrono::Duration::seconds(1)));
    }

    proptest! {
        #[test]
        fn project_total_is_its_best_offer(values in prop::collection::vec(0u32..100_000, 1..12)) {
            let rows: Vec<_> = values
                .iter()
                .enumerate()
                .map(|(i, v)| row(i as u128 + 1, Some(99), OfferPhase::Sent, Decimal::from(*v), 40))
                .collect();
            let stats = merge_phases(&aggregate_by_company(&rows));
            let sent = phase_totals(&stats, OfferPhase::Sent);
            let max = values.iter().copied().max().unwrap_or(0);
            prop_assert_eq!(sent.total_value, Decimal::from(max));
            prop_assert_eq!(sent.offer_count, values.len() as u64);
            prop_assert_eq!(sent.project_count, 1);
        }

        #[test]
        fn per_company_rows_merge_to_the_same_totals(
            assignments in prop::collection::vec((0u8..3, 0u128..4, 0usize..5, 0u32..10_000, 0u8..=100), 0..40)
        ) {
            let rows: Vec<_> = assignments
                .iter()
                .enumerate()
                .map(|(i, (company, project, phase, value, p))| {
                    let mut r = row(
                        i as u128 + 1,
                        (*project > 0).then_some(*project),
                        OfferPhase::PIPELINE[*phase],
                        Decimal::from(*value),
                        *p,
                    );
                    r.company_id = CompanyId::new(format!("c{company}"));
                    r
                })
                .collect();
            let merged = merge_phases(&aggregate_by_company(&rows));

            let mut per_company = Vec::new();
            for company in 0..3u8 {
                let id = CompanyId::new(format!("c{company}"));
                let subset: Vec<_> = rows.iter().filter(|r| r.company_id == id).cloned().collect();
                per_company.extend(aggregate_by_company(&subset));
            }
            prop_assert_eq!(merged, merge_phases(&per_company));
        }
    }
}

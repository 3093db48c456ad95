//! Project phase workflow: winner adoption, best-offer economics, health.

use crate::error::{EngineError, EngineResult};
use crate::numbering::DocumentNumbering;
use chrono::Utc;
use pipeline_store::PipelineStore;
use pipeline_types::{
    BudgetItem, BudgetItemId, BudgetParent, CompanyId, CustomerUpdate, NewProject, Offer,
    OfferId, OfferPhase, Project, ProjectEconomics, ProjectHealth, ProjectId, ProjectPhase,
    TenantScope, WinningOffer,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Budget status of a project at the time of the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub project_id: ProjectId,
    pub health: ProjectHealth,
    pub budget: Decimal,
    pub spent: Decimal,
    /// Spent as a percentage of budget; zero when there is no budget.
    pub used_percent: Decimal,
}

pub struct ProjectLifecycle {
    store: Arc<dyn PipelineStore>,
    numbering: Arc<DocumentNumbering>,
}

impl ProjectLifecycle {
    pub fn new(store: Arc<dyn PipelineStore>, numbering: Arc<DocumentNumbering>) -> Self {
        Self { store, numbering }
    }

    /// Create a bidding project with a number from the shared sequence.
    pub async fn create_project(
        &self,
        scope: &TenantScope,
        new: NewProject,
    ) -> EngineResult<Project> {
        if !scope.allows(&new.company_id) {
            return Err(EngineError::InvalidInput(format!(
                "company {} is outside the caller's scope",
                new.company_id
            )));
        }
        let number = self
            .numbering
            .generate_project_number(&new.company_id)
            .await?;
        let project = new.into_project(ProjectId::generate(), number, Utc::now());
        self.store.insert_project(&project).await?;
        tracing::info!(
            project_id = %project.id,
            company = %project.company_id,
            number = %project.project_number,
            "Created project"
        );
        Ok(project)
    }

    pub async fn get_project(&self, scope: &TenantScope, id: ProjectId) -> EngineResult<Project> {
        self.store
            .get_project(scope, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("project {id} not found")))
    }

    /// Promote a bidding project using one of its offers that already won.
    ///
    /// The offer must be in `order`. Winning a `sent` offer, with its
    /// sibling expiry, goes through
    /// [`OfferLifecycle::transition`](crate::OfferLifecycle::transition); this
    /// only adopts an order that was linked to the project afterwards.
    pub async fn set_winning_offer(
        &self,
        scope: &TenantScope,
        project_id: ProjectId,
        offer_id: OfferId,
    ) -> EngineResult<Project> {
        let offer = self
            .store
            .get_offer(scope, offer_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("offer {offer_id} not found")))?;
        if offer.project_id != Some(project_id) {
            return Err(EngineError::InvalidInput(format!(
                "offer {offer_id} does not belong to project {project_id}"
            )));
        }
        if offer.phase != OfferPhase::Order {
            return Err(EngineError::InvalidTransition(format!(
                "offer {offer_id} is {} and has not won",
                offer.phase
            )));
        }
        let project = self.get_project(scope, project_id).await?;
        Self::ensure_can_win(&project)?;

        let project = self
            .store
            .set_winning_offer(scope, project_id, &winner_from_offer(&offer))
            .await?;
        tracing::info!(
            project_id = %project_id,
            offer_id = %offer_id,
            value = %project.value,
            "Project won"
        );
        Ok(project)
    }

    pub(crate) fn ensure_can_win(project: &Project) -> EngineResult<()> {
        if let Some(existing) = project.winning_offer_id {
            return Err(EngineError::Conflict(format!(
                "project {} already won by {existing}",
                project.id
            )));
        }
        if project.phase != ProjectPhase::Tilbud {
            return Err(EngineError::transition(
                format!("project {}", project.id),
                project.phase,
                ProjectPhase::Active,
            ));
        }
        Ok(())
    }

    /// Recompute a bidding project's value, cost, budget and customer from its
    /// active offers.
    ///
    /// Returns the updated project, or `None` when the project is no longer
    /// bidding and was left untouched.
    pub async fn recalculate_best_offer_economics(
        &self,
        scope: &TenantScope,
        project_id: ProjectId,
    ) -> EngineResult<Option<Project>> {
        let project = self.get_project(scope, project_id).await?;
        if project.phase != ProjectPhase::Tilbud {
            return Ok(None);
        }

        let offers = self.store.list_project_offers(scope, project_id).await?;
        let active: Vec<&Offer> = offers.iter().filter(|o| o.phase.is_active()).collect();
        let best = best_offer(&active);
        let economics = ProjectEconomics {
            value: best.map_or(Decimal::ZERO, |o| o.value),
            cost: best.map_or(Decimal::ZERO, |o| o.cost),
            budget: best.map_or(Decimal::ZERO, |o| o.value),
            customer: infer_customer(&active),
            updated_at: Utc::now(),
        };

        if !self
            .store
            .update_project_economics(scope, project_id, &economics)
            .await?
        {
            tracing::debug!(
                project_id = %project_id,
                "Project left bidding before economics update"
            );
            return Ok(None);
        }
        tracing::debug!(
            project_id = %project_id,
            value = %economics.value,
            active_offers = active.len(),
            "Recalculated best offer economics"
        );
        Ok(Some(self.get_project(scope, project_id).await?))
    }

    /// Manual phase change. Bidding projects only become active by winning.
    pub async fn change_phase(
        &self,
        scope: &TenantScope,
        project_id: ProjectId,
        target: ProjectPhase,
    ) -> EngineResult<Project> {
        let project = self.get_project(scope, project_id).await?;
        if !project.phase.can_change_manually_to(target) {
            return Err(EngineError::transition(
                format!("project {project_id}"),
                project.phase,
                target,
            ));
        }
        let updated = self
            .store
            .change_project_phase(scope, project_id, project.phase, target, Utc::now())
            .await?;
        tracing::info!(
            project_id = %project_id,
            from = %project.phase,
            to = %target,
            "Project phase changed"
        );
        Ok(updated)
    }

    /// Current budget health. Spend comes from budget lines when the project
    /// has a detailed budget, otherwise from the stored `spent` field.
    pub async fn health(
        &self,
        scope: &TenantScope,
        project_id: ProjectId,
    ) -> EngineResult<HealthReport> {
        let project = self.get_project(scope, project_id).await?;
        let spent = if project.has_detailed_budget {
            self.store
                .list_budget_items(scope, BudgetParent::Project(project_id))
                .await?
                .iter()
                .map(|item| item.expected_cost)
                .sum::<Decimal>()
        } else {
            project.spent
        };
        let used_percent = if project.budget > Decimal::ZERO {
            (spent * Decimal::ONE_HUNDRED / project.budget).round_dp(2)
        } else {
            Decimal::ZERO
        };
        Ok(HealthReport {
            project_id,
            health: ProjectHealth::from_budget(project.budget, spent),
            budget: project.budget,
            spent,
            used_percent,
        })
    }

    /// Attach a budget line to an offer or a project visible to the caller.
    pub async fn add_budget_item(
        &self,
        scope: &TenantScope,
        parent: BudgetParent,
        name: impl Into<String>,
        expected_cost: Decimal,
    ) -> EngineResult<BudgetItem> {
        let company: CompanyId = match parent {
            BudgetParent::Offer(id) => {
                self.store
                    .get_offer(scope, id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("offer {id} not found")))?
                    .company_id
            }
            BudgetParent::Project(id) => self.get_project(scope, id).await?.company_id,
        };
        let item = BudgetItem {
            id: BudgetItemId::generate(),
            company_id: company,
            parent,
            name: name.into(),
            expected_cost,
            created_at: Utc::now(),
        };
        self.store.insert_budget_item(&item).await?;
        Ok(item)
    }
}

/// Data a project adopts from the offer that wins it.
pub(crate) fn winner_from_offer(offer: &Offer) -> WinningOffer {
    WinningOffer {
        offer_id: offer.id,
        value: offer.value,
        cost: offer.cost,
        customer_id: offer.customer_id,
        customer_name: offer.customer_name.clone(),
        manager_id: offer.responsible_user_id.clone(),
        manager_name: offer.responsible_user_name.clone(),
        description: offer.description.clone(),
        location: offer.location.clone(),
        won_at: Utc::now(),
    }
}

/// Highest value; the lowest id wins ties.
fn best_offer<'a>(offers: &[&'a Offer]) -> Option<&'a Offer> {
    offers
        .iter()
        .copied()
        .max_by(|a, b| a.value.cmp(&b.value).then_with(|| b.id.cmp(&a.id)))
}

/// One shared customer is propagated. Any disagreement, including offers
/// without a customer next to offers with one, clears it. No active offers
/// leaves it unchanged.
pub fn infer_customer(active: &[&Offer]) -> CustomerUpdate {
    if active.is_empty() {
        return CustomerUpdate::Unchanged;
    }
    let distinct: BTreeSet<_> = active.iter().map(|o| o.customer_id).collect();
    match (distinct.len(), distinct.into_iter().next().flatten()) {
        (1, Some(id)) => CustomerUpdate::Known {
            id,
            name: active.iter().find_map(|o| o.customer_name.clone()),
        },
        _ => CustomerUpdate::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_types::{CustomerId, NewOffer};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn offer(id: u128, value: Decimal, customer: Option<CustomerId>) -> Offer {
        let mut o = NewOffer::new(CompanyId::new("acme"), "o")
            .in_phase(OfferPhase::Sent)
            .priced(value, Decimal::ZERO, 50)
            .into_offer(
                OfferId::from_uuid(Uuid::from_u128(id)),
                Some(format!("A-{id}")),
                Utc::now(),
            );
        o.customer_id = customer;
        o.customer_name = customer.map(|_| "Customer".to_string());
        o
    }

    #[test]
    fn test_best_offer_prefers_value_then_lowest_id() {
        let a = offer(5, dec!(700), None);
        let b = offer(2, dec!(700), None);
        let c = offer(1, dec!(300), None);
        let best = best_offer(&[&a, &b, &c]).unwrap();
        assert_eq!(best.id, b.id);
        assert!(best_offer(&[]).is_none());
    }

    #[test]
    fn test_shared_customer_is_propagated() {
        let cust = CustomerId::generate();
        let a = offer(1, dec!(1), Some(cust));
        let b = offer(2, dec!(2), Some(cust));
        assert_eq!(
            infer_customer(&[&a, &b]),
            CustomerUpdate::Known {
                id: cust,
                name: Some("Customer".into())
            }
        );
    }

    #[test]
    fn test_disagreeing_customers_become_unknown() {
        let a = offer(1, dec!(1), Some(CustomerId::generate()));
        let b = offer(2, dec!(2), Some(CustomerId::generate()));
        assert_eq!(infer_customer(&[&a, &b]), CustomerUpdate::Unknown);

        let c = offer(3, dec!(3), None);
        assert_eq!(infer_customer(&[&a, &c]), CustomerUpdate::Unknown);
        assert_eq!(infer_customer(&[&c]), CustomerUpdate::Unknown);
        assert_eq!(infer_customer(&[]), CustomerUpdate::Unchanged);
    }
}

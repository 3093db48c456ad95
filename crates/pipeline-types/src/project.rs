//! Projects, the project phase machine, winner adoption and health.

use crate::error::{DomainError, DomainResult};
use crate::ids::{BudgetItemId, CustomerId, OfferId, ProjectId, UserId};
use crate::tenant::CompanyId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle phase of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    /// Bidding. Economics follow the best active offer.
    Tilbud,
    Active,
    Completed,
    Cancelled,
}

impl ProjectPhase {
    pub const ALL: [ProjectPhase; 4] = [
        ProjectPhase::Tilbud,
        ProjectPhase::Active,
        ProjectPhase::Completed,
        ProjectPhase::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tilbud => "tilbud",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Targets reachable by a manual phase change.
    ///
    /// `Tilbud -> Active` is absent: only a winning offer promotes a project.
    pub fn manual_successors(self) -> &'static [ProjectPhase] {
        use ProjectPhase::*;
        match self {
            Tilbud => &[Cancelled],
            Active => &[Completed, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    pub fn can_change_manually_to(self, target: ProjectPhase) -> bool {
        self.manual_successors().contains(&target)
    }
}

impl fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectPhase {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| DomainError::UnknownVariant {
                kind: "project phase",
                value: s.to_string(),
            })
    }
}

/// A project, optionally won through one of its offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub company_id: CompanyId,
    pub name: String,
    pub project_number: String,
    pub phase: ProjectPhase,
    pub value: Decimal,
    pub cost: Decimal,
    pub budget: Decimal,
    pub spent: Decimal,
    pub has_detailed_budget: bool,
    pub customer_id: Option<CustomerId>,
    pub customer_name: Option<String>,
    pub manager_id: Option<UserId>,
    pub manager_name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub winning_offer_id: Option<OfferId>,
    pub won_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// `(value - cost) / value × 100`, or zero without a positive value.
    pub fn margin_percent(&self) -> Decimal {
        if self.value <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.value - self.cost) / self.value * Decimal::ONE_HUNDRED
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.winning_offer_id.is_some() && self.phase == ProjectPhase::Tilbud {
            return Err(DomainError::Invalid(
                "a won project cannot still be bidding".into(),
            ));
        }
        Ok(())
    }
}

/// Input for creating a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProject {
    pub company_id: CompanyId,
    pub name: String,
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub manager_id: Option<UserId>,
    #[serde(default)]
    pub manager_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub budget: Decimal,
    #[serde(default)]
    pub spent: Decimal,
    #[serde(default)]
    pub has_detailed_budget: bool,
}

impl NewProject {
    pub fn new(company_id: CompanyId, name: impl Into<String>) -> Self {
        Self {
            company_id,
            name: name.into(),
            customer_id: None,
            customer_name: None,
            manager_id: None,
            manager_name: None,
            description: None,
            location: None,
            budget: Decimal::ZERO,
            spent: Decimal::ZERO,
            has_detailed_budget: false,
        }
    }

    pub fn into_project(self, id: ProjectId, project_number: String, now: DateTime<Utc>) -> Project {
        Project {
            id,
            company_id: self.company_id,
            name: self.name,
            project_number,
            phase: ProjectPhase::Tilbud,
            value: Decimal::ZERO,
            cost: Decimal::ZERO,
            budget: self.budget,
            spent: self.spent,
            has_detailed_budget: self.has_detailed_budget,
            customer_id: self.customer_id,
            customer_name: self.customer_name,
            manager_id: self.manager_id,
            manager_name: self.manager_name,
            description: self.description,
            location: self.location,
            winning_offer_id: None,
            won_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a project takes over from the offer that won it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinningOffer {
    pub offer_id: OfferId,
    pub value: Decimal,
    pub cost: Decimal,
    pub customer_id: Option<CustomerId>,
    pub customer_name: Option<String>,
    pub manager_id: Option<UserId>,
    pub manager_name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub won_at: DateTime<Utc>,
}

impl WinningOffer {
    /// Promote `project` to active and copy the offer's data onto it.
    ///
    /// Value, cost and customer are always taken. Manager, description and
    /// location only fill fields the project has not set itself.
    pub fn adopt_into(&self, project: &mut Project) {
        project.phase = ProjectPhase::Active;
        project.winning_offer_id = Some(self.offer_id);
        project.won_at = Some(self.won_at);
        project.value = self.value;
        project.cost = self.cost;
        project.customer_id = self.customer_id;
        project.customer_name = self.customer_name.clone();

        if project.manager_id.is_none() {
            project.manager_id = self.manager_id.clone();
            project.manager_name = self.manager_name.clone();
        }
        if is_blank(project.description.as_deref()) {
            project.description = self.description.clone();
        }
        if is_blank(project.location.as_deref()) {
            project.location = self.location.clone();
        }
        project.updated_at = self.won_at;
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

/// Customer outcome of best-offer inference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CustomerUpdate {
    /// Leave the stored customer as is.
    Unchanged,
    /// Every active offer names the same customer.
    Known {
        id: CustomerId,
        name: Option<String>,
    },
    /// Active offers disagree; the customer is cleared.
    Unknown,
}

/// Economics written onto a bidding project from its active offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEconomics {
    pub value: Decimal,
    pub cost: Decimal,
    pub budget: Decimal,
    pub customer: CustomerUpdate,
    pub updated_at: DateTime<Utc>,
}

impl ProjectEconomics {
    pub fn apply(&self, project: &mut Project) {
        project.value = self.value;
        project.cost = self.cost;
        project.budget = self.budget;
        match &self.customer {
            CustomerUpdate::Unchanged => {}
            CustomerUpdate::Known { id, name } => {
                project.customer_id = Some(*id);
                project.customer_name = name.clone();
            }
            CustomerUpdate::Unknown => {
                project.customer_id = None;
                project.customer_name = None;
            }
        }
        project.updated_at = self.updated_at;
    }
}

/// Budget health of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectHealth {
    OnTrack,
    AtRisk,
    OverBudget,
}

impl ProjectHealth {
    /// Classify spend against budget.
    ///
    /// Below 110% is on track, 110% through 120% is at risk, above 120% is
    /// over budget. A budget of zero or less is always on track.
    pub fn from_budget(budget: Decimal, spent: Decimal) -> Self {
        if budget <= Decimal::ZERO {
            return Self::OnTrack;
        }
        let used = spent * Decimal::ONE_HUNDRED / budget;
        if used > Decimal::from(120) {
            Self::OverBudget
        } else if used >= Decimal::from(110) {
            Self::AtRisk
        } else {
            Self::OnTrack
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnTrack => "on_track",
            Self::AtRisk => "at_risk",
            Self::OverBudget => "over_budget",
        }
    }
}

/// Owner of a budget line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BudgetParent {
    Offer(OfferId),
    Project(ProjectId),
}

impl BudgetParent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Project(_) => "project",
        }
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        match self {
            Self::Offer(id) => id.as_uuid(),
            Self::Project(id) => id.as_uuid(),
        }
    }

    pub fn from_parts(kind: &str, id: uuid::Uuid) -> DomainResult<Self> {
        match kind {
            "offer" => Ok(Self::Offer(OfferId::from_uuid(id))),
            "project" => Ok(Self::Project(ProjectId::from_uuid(id))),
            other => Err(DomainError::UnknownVariant {
                kind: "budget parent",
                value: other.to_string(),
            }),
        }
    }
}

/// A budget line item attached to an offer or a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetItem {
    pub id: BudgetItemId,
    pub company_id: CompanyId,
    pub parent: BudgetParent,
    pub name: String,
    pub expected_cost: Decimal,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn project() -> Project {
        NewProject::new(CompanyId::new("acme"), "Warehouse").into_project(
            ProjectId::generate(),
            "AC-2025-001".into(),
            Utc::now(),
        )
    }

    fn winner() -> WinningOffer {
        WinningOffer {
            offer_id: OfferId::generate(),
            value: dec!(700),
            cost: dec!(500),
            customer_id: Some(CustomerId::generate()),
            customer_name: Some("Nordic Steel".into()),
            manager_id: Some(UserId::new("u-1")),
            manager_name: Some("Kari".into()),
            description: Some("Offer text".into()),
            location: Some("Oslo".into()),
            won_at: Utc::now(),
        }
    }

    #[test]
    fn test_health_thresholds() {
        assert_eq!(
            ProjectHealth::from_budget(dec!(1000), dec!(1150)),
            ProjectHealth::AtRisk
        );
        assert_eq!(
            ProjectHealth::from_budget(dec!(1000), dec!(1250)),
            ProjectHealth::OverBudget
        );
        assert_eq!(
            ProjectHealth::from_budget(dec!(0), dec!(999999)),
            ProjectHealth::OnTrack
        );
        assert_eq!(
            ProjectHealth::from_budget(dec!(1000), dec!(1090)),
            ProjectHealth::OnTrack
        );
        assert_eq!(
            ProjectHealth::from_budget(dec!(1000), dec!(1100)),
            ProjectHealth::AtRisk
        );
        assert_eq!(
            ProjectHealth::from_budget(dec!(1000), dec!(1200)),
            ProjectHealth::AtRisk
        );
    }

    #[test]
    fn test_negative_budget_is_on_track() {
        assert_eq!(
            ProjectHealth::from_budget(dec!(-5), dec!(10)),
            ProjectHealth::OnTrack
        );
    }

    #[test]
    fn test_margin_percent() {
        let mut p = project();
        p.value = dec!(1000);
        p.cost = dec!(750);
        assert_eq!(p.margin_percent(), dec!(25));
        p.value = Decimal::ZERO;
        assert_eq!(p.margin_percent(), Decimal::ZERO);
    }

    #[test]
    fn test_adoption_fills_only_missing_fields() {
        let mut p = project();
        p.manager_id = Some(UserId::new("u-9"));
        p.manager_name = Some("Ola".into());
        p.description = Some("Manual text".into());
        let w = winner();
        w.adopt_into(&mut p);

        assert_eq!(p.phase, ProjectPhase::Active);
        assert_eq!(p.value, dec!(700));
        assert_eq!(p.cost, dec!(500));
        assert_eq!(p.customer_id, w.customer_id);
        assert_eq!(p.manager_id, Some(UserId::new("u-9")));
        assert_eq!(p.description.as_deref(), Some("Manual text"));
        assert_eq!(p.location.as_deref(), Some("Oslo"));
        assert_eq!(p.winning_offer_id, Some(w.offer_id));
        assert_eq!(p.won_at, Some(w.won_at));
    }

    #[test]
    fn test_blank_description_is_replaced() {
        let mut p = project();
        p.description = Some("   ".into());
        winner().adopt_into(&mut p);
        assert_eq!(p.description.as_deref(), Some("Offer text"));
    }

    #[test]
    fn test_manual_phase_changes() {
        assert!(!ProjectPhase::Tilbud.can_change_manually_to(ProjectPhase::Active));
        assert!(ProjectPhase::Tilbud.can_change_manually_to(ProjectPhase::Cancelled));
        assert!(ProjectPhase::Active.can_change_manually_to(ProjectPhase::Completed));
        assert!(ProjectPhase::Completed.manual_successors().is_empty());
    }

    #[test]
    fn test_budget_parent_parts() {
        let id = ProjectId::generate();
        let parent = BudgetParent::Project(id);
        assert_eq!(parent.kind(), "project");
        assert_eq!(
            BudgetParent::from_parts("project", *id.as_uuid()).unwrap(),
            parent
        );
        assert!(BudgetParent::from_parts("deal", *id.as_uuid()).is_err());
    }
}

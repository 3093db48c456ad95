//! Sales offers and the offer phase machine.

use crate::error::{DomainError, DomainResult};
use crate::ids::{CustomerId, OfferId, ProjectId, UserId};
use crate::tenant::CompanyId;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Days between sending an offer and its default expiration date.
pub const OFFER_VALIDITY_DAYS: i64 = 60;

/// Lifecycle phase of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferPhase {
    Draft,
    InProgress,
    Sent,
    Order,
    Completed,
    Lost,
    Expired,
}

impl OfferPhase {
    pub const ALL: [OfferPhase; 7] = [
        OfferPhase::Draft,
        OfferPhase::InProgress,
        OfferPhase::Sent,
        OfferPhase::Order,
        OfferPhase::Completed,
        OfferPhase::Lost,
        OfferPhase::Expired,
    ];

    /// Phases counted by the dashboard pipeline, in display order.
    pub const PIPELINE: [OfferPhase; 5] = [
        OfferPhase::InProgress,
        OfferPhase::Sent,
        OfferPhase::Order,
        OfferPhase::Completed,
        OfferPhase::Lost,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::InProgress => "in_progress",
            Self::Sent => "sent",
            Self::Order => "order",
            Self::Completed => "completed",
            Self::Lost => "lost",
            Self::Expired => "expired",
        }
    }

    /// Draft, in progress and sent offers are still being worked.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Draft | Self::InProgress | Self::Sent)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn is_pipeline(self) -> bool {
        Self::PIPELINE.contains(&self)
    }

    /// Offers in reserve: worked on or sent, but not yet decided.
    pub fn is_reserve(self) -> bool {
        matches!(self, Self::InProgress | Self::Sent)
    }

    pub fn is_won(self) -> bool {
        matches!(self, Self::Order | Self::Completed)
    }

    /// Legal targets of a normal lifecycle transition.
    ///
    /// Sibling expiry after a win bypasses this table; it only ever moves an
    /// active offer to `Expired`, which is also a legal edge here.
    pub fn successors(self) -> &'static [OfferPhase] {
        use OfferPhase::*;
        match self {
            Draft => &[InProgress, Lost, Expired],
            InProgress => &[Sent, Lost, Expired],
            Sent => &[Order, Lost, Expired],
            Order => &[Completed],
            Completed | Lost | Expired => &[],
        }
    }

    pub fn can_transition_to(self, target: OfferPhase) -> bool {
        self.successors().contains(&target)
    }
}

impl fmt::Display for OfferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OfferPhase {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| DomainError::UnknownVariant {
                kind: "offer phase",
                value: s.to_string(),
            })
    }
}

/// Why a deal was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReasonCategory {
    Price,
    Timing,
    Competitor,
    Requirements,
    Other,
}

impl LossReasonCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Timing => "timing",
            Self::Competitor => "competitor",
            Self::Requirements => "requirements",
            Self::Other => "other",
        }
    }
}

impl FromStr for LossReasonCategory {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "price" => Ok(Self::Price),
            "timing" => Ok(Self::Timing),
            "competitor" => Ok(Self::Competitor),
            "requirements" => Ok(Self::Requirements),
            "other" => Ok(Self::Other),
            other => Err(DomainError::UnknownVariant {
                kind: "loss reason category",
                value: other.to_string(),
            }),
        }
    }
}

/// A sales offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub company_id: CompanyId,
    pub project_id: Option<ProjectId>,
    pub customer_id: Option<CustomerId>,
    pub customer_name: Option<String>,
    pub title: String,
    pub phase: OfferPhase,
    pub value: Decimal,
    pub cost: Decimal,
    pub probability: u8,
    pub offer_number: Option<String>,
    pub external_reference: Option<String>,
    pub responsible_user_id: Option<UserId>,
    pub responsible_user_name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub loss_reason_category: Option<LossReasonCategory>,
    pub loss_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Offer {
    /// `value × probability / 100`.
    pub fn weighted_value(&self) -> Decimal {
        weighted_value(self.value, self.probability)
    }

    /// Check the record-level invariants before it is persisted.
    pub fn validate(&self) -> DomainResult<()> {
        if self.probability > 100 {
            return Err(DomainError::Invalid(format!(
                "probability {} outside 0..=100",
                self.probability
            )));
        }
        match (self.phase, self.offer_number.as_deref()) {
            (OfferPhase::Draft, Some(_)) => Err(DomainError::Invalid(
                "draft offers cannot carry an offer number".into(),
            )),
            (phase, None) if phase != OfferPhase::Draft => Err(DomainError::Invalid(format!(
                "{phase} offers must carry an offer number"
            ))),
            _ => Ok(()),
        }
    }
}

/// Input for creating an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOffer {
    pub company_id: CompanyId,
    pub title: String,
    #[serde(default = "default_new_phase")]
    pub phase: OfferPhase,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub value: Decimal,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub probability: u8,
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub responsible_user_id: Option<UserId>,
    #[serde(default)]
    pub responsible_user_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

fn default_new_phase() -> OfferPhase {
    OfferPhase::Draft
}

impl NewOffer {
    pub fn new(company_id: CompanyId, title: impl Into<String>) -> Self {
        Self {
            company_id,
            title: title.into(),
            phase: OfferPhase::Draft,
            project_id: None,
            customer_id: None,
            customer_name: None,
            value: Decimal::ZERO,
            cost: Decimal::ZERO,
            probability: 0,
            external_reference: None,
            responsible_user_id: None,
            responsible_user_name: None,
            description: None,
            location: None,
        }
    }

    pub fn in_phase(mut self, phase: OfferPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn for_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn for_customer(mut self, customer_id: CustomerId, name: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id);
        self.customer_name = Some(name.into());
        self
    }

    pub fn priced(mut self, value: Decimal, cost: Decimal, probability: u8) -> Self {
        self.value = value;
        self.cost = cost;
        self.probability = probability;
        self
    }

    /// Materialize the record. `offer_number` must already be allocated for
    /// non-draft phases.
    pub fn into_offer(
        self,
        id: OfferId,
        offer_number: Option<String>,
        now: DateTime<Utc>,
    ) -> Offer {
        let sent_at = (self.phase == OfferPhase::Sent).then_some(now);
        Offer {
            id,
            company_id: self.company_id,
            project_id: self.project_id,
            customer_id: self.customer_id,
            customer_name: self.customer_name,
            title: self.title,
            phase: self.phase,
            value: self.value,
            cost: self.cost,
            probability: self.probability,
            offer_number,
            external_reference: self.external_reference.filter(|r| !r.is_empty()),
            responsible_user_id: self.responsible_user_id,
            responsible_user_name: self.responsible_user_name,
            description: self.description,
            location: self.location,
            sent_at,
            expires_at: sent_at.map(|at| at + Duration::days(OFFER_VALIDITY_DAYS)),
            closed_at: None,
            loss_reason_category: None,
            loss_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Column changes written together with a phase change.
///
/// `None` leaves the stored column untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPhaseChange {
    pub to: OfferPhase,
    pub probability: Option<u8>,
    pub offer_number: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub loss_reason_category: Option<LossReasonCategory>,
    pub loss_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OfferPhaseChange {
    pub fn to(phase: OfferPhase, now: DateTime<Utc>) -> Self {
        Self {
            to: phase,
            probability: None,
            offer_number: None,
            sent_at: None,
            expires_at: None,
            closed_at: None,
            loss_reason_category: None,
            loss_reason: None,
            updated_at: now,
        }
    }

    /// Apply the change to an in-memory record.
    pub fn apply(&self, offer: &mut Offer) {
        offer.phase = self.to;
        if let Some(p) = self.probability {
            offer.probability = p;
        }
        if let Some(number) = &self.offer_number {
            offer.offer_number = Some(number.clone());
        }
        if self.sent_at.is_some() {
            offer.sent_at = self.sent_at;
        }
        if self.expires_at.is_some() {
            offer.expires_at = self.expires_at;
        }
        if self.closed_at.is_some() {
            offer.closed_at = self.closed_at;
        }
        if self.loss_reason_category.is_some() {
            offer.loss_reason_category = self.loss_reason_category;
        }
        if self.loss_reason.is_some() {
            offer.loss_reason = self.loss_reason.clone();
        }
        offer.updated_at = self.updated_at;
    }
}

/// `value × probability / 100`.
pub fn weighted_value(value: Decimal, probability: u8) -> Decimal {
    value * Decimal::from(probability) / Decimal::ONE_HUNDRED
}

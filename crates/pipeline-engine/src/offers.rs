//! Offer phase workflow.
//!
//! Every transition is checked against the phase table before anything is
//! written. Winning (`sent -> order`) is a single storage transaction that
//! also promotes the project and expires the competing offers.

use crate::error::{EngineError, EngineResult};
use crate::numbering::DocumentNumbering;
use crate::projects::{winner_from_offer, ProjectLifecycle};
use chrono::{DateTime, Duration, Utc};
use pipeline_store::{OfferPricing, OfferWin, PipelineStore, ProjectWin};
use pipeline_types::{
    has_win_suffix, LossReasonCategory, NewOffer, Offer, OfferId, OfferPhase, OfferPhaseChange,
    Project, ProjectId, TenantScope, OFFER_VALIDITY_DAYS,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Caller-supplied details for a phase change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionMetadata {
    /// Required when moving to `lost`.
    #[serde(default)]
    pub loss_reason_category: Option<LossReasonCategory>,
    #[serde(default)]
    pub loss_reason: Option<String>,
}

impl TransitionMetadata {
    pub fn lost(category: LossReasonCategory, reason: impl Into<String>) -> Self {
        Self {
            loss_reason_category: Some(category),
            loss_reason: Some(reason.into()),
        }
    }
}

/// Records changed by a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub offer: Offer,
    /// The linked project after promotion or recalculation, when it changed.
    pub project: Option<Project>,
    /// Sibling offers expired by a win.
    pub expired_siblings: Vec<OfferId>,
}

pub struct OfferLifecycle {
    store: Arc<dyn PipelineStore>,
    numbering: Arc<DocumentNumbering>,
    projects: Arc<ProjectLifecycle>,
}

impl OfferLifecycle {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        numbering: Arc<DocumentNumbering>,
        projects: Arc<ProjectLifecycle>,
    ) -> Self {
        Self {
            store,
            numbering,
            projects,
        }
    }

    /// Create an offer. Non-draft offers get a number immediately.
    pub async fn create_offer(&self, scope: &TenantScope, new: NewOffer) -> EngineResult<Offer> {
        if !scope.allows(&new.company_id) {
            return Err(EngineError::InvalidInput(format!(
                "company {} is outside the caller's scope",
                new.company_id
            )));
        }
        if !self.numbering.directory().contains(&new.company_id) {
            return Err(EngineError::InvalidInput(format!(
                "unknown company {}",
                new.company_id
            )));
        }
        check_probability(new.probability)?;
        if !new.phase.is_active() {
            return Err(EngineError::InvalidInput(format!(
                "offers cannot be created in phase {}",
                new.phase
            )));
        }
        if let Some(reference) = new.external_reference.as_deref() {
            if !self
                .numbering
                .check_external_reference_unique(reference, &new.company_id, None)
                .await?
            {
                return Err(EngineError::Conflict(format!(
                    "external reference {reference} already used in {}",
                    new.company_id
                )));
            }
        }
        if let Some(project_id) = new.project_id {
            let project = self.projects.get_project(scope, project_id).await?;
            if project.company_id != new.company_id {
                return Err(EngineError::InvalidInput(format!(
                    "project {project_id} belongs to another company"
                )));
            }
        }

        let number = if new.phase == OfferPhase::Draft {
            None
        } else {
            Some(self.numbering.generate_offer_number(&new.company_id).await?)
        };
        let offer = new.into_offer(OfferId::generate(), number, Utc::now());
        offer.validate()?;
        self.store.insert_offer(&offer).await?;
        tracing::info!(
            offer_id = %offer.id,
            company = %offer.company_id,
            phase = %offer.phase,
            number = offer.offer_number.as_deref().unwrap_or("-"),
            "Created offer"
        );

        if let Some(project_id) = offer.project_id {
            self.projects
                .recalculate_best_offer_economics(scope, project_id)
                .await?;
        }
        Ok(offer)
    }

    pub async fn get_offer(&self, scope: &TenantScope, id: OfferId) -> EngineResult<Offer> {
        self.store
            .get_offer(scope, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("offer {id} not found")))
    }

    pub async fn list_project_offers(
        &self,
        scope: &TenantScope,
        project_id: ProjectId,
    ) -> EngineResult<Vec<Offer>> {
        self.projects.get_project(scope, project_id).await?;
        Ok(self.store.list_project_offers(scope, project_id).await?)
    }

    /// Move an offer to `target`.
    ///
    /// Illegal edges fail with `InvalidTransition` before any write. Moving
    /// to `order` runs the win workflow; every other change recalculates the
    /// linked project's economics afterwards.
    pub async fn transition(
        &self,
        scope: &TenantScope,
        id: OfferId,
        target: OfferPhase,
        metadata: TransitionMetadata,
    ) -> EngineResult<TransitionOutcome> {
        let offer = self.get_offer(scope, id).await?;
        if !offer.phase.can_transition_to(target) {
            return Err(EngineError::transition(
                format!("offer {id}"),
                offer.phase,
                target,
            ));
        }
        if target == OfferPhase::Lost && metadata.loss_reason_category.is_none() {
            return Err(EngineError::InvalidInput(
                "a loss reason category is required to mark an offer lost".into(),
            ));
        }
        if target == OfferPhase::Order {
            return self.win(scope, offer).await;
        }

        let now = Utc::now();
        let mut change = OfferPhaseChange::to(target, now);
        if offer.offer_number.is_none() {
            change.offer_number = Some(
                self.numbering
                    .generate_offer_number(&offer.company_id)
                    .await?,
            );
        }
        match target {
            OfferPhase::Sent => {
                let sent_at = offer.sent_at.unwrap_or(now);
                change.sent_at = Some(sent_at);
                if offer.expires_at.is_none() {
                    change.expires_at = Some(default_expiry(sent_at));
                }
            }
            OfferPhase::Lost => {
                change.probability = Some(0);
                change.closed_at = Some(now);
                change.loss_reason_category = metadata.loss_reason_category;
                change.loss_reason = metadata.loss_reason;
            }
            OfferPhase::Expired => change.closed_at = Some(now),
            OfferPhase::Draft
            | OfferPhase::InProgress
            | OfferPhase::Order
            | OfferPhase::Completed => {}
        }

        let updated = self
            .store
            .transition_offer(scope, id, offer.phase, &change)
            .await?;
        tracing::info!(offer_id = %id, from = %offer.phase, to = %target, "Offer phase changed");

        let project = match updated.project_id {
            Some(project_id) => {
                self.projects
                    .recalculate_best_offer_economics(scope, project_id)
                    .await?
            }
            None => None,
        };
        Ok(TransitionOutcome {
            offer: updated,
            project,
            expired_siblings: Vec::new(),
        })
    }

    async fn win(&self, scope: &TenantScope, offer: Offer) -> EngineResult<TransitionOutcome> {
        let now = Utc::now();
        let suffix = self.numbering.win_suffix();
        let mut change = OfferPhaseChange::to(OfferPhase::Order, now);
        change.probability = Some(100);
        change.closed_at = Some(now);
        change.offer_number = match offer.offer_number.as_deref() {
            Some(number) if !has_win_suffix(number, suffix) => Some(format!("{number}{suffix}")),
            Some(_) => None,
            None => Some(format!(
                "{}{suffix}",
                self.numbering
                    .generate_offer_number(&offer.company_id)
                    .await?
            )),
        };

        let project = match offer.project_id {
            Some(project_id) => {
                let project = self.projects.get_project(scope, project_id).await?;
                ProjectLifecycle::ensure_can_win(&project)?;
                Some(ProjectWin {
                    project_id,
                    adoption: winner_from_offer(&offer),
                })
            }
            None => None,
        };

        let receipt = self
            .store
            .commit_offer_win(
                scope,
                &OfferWin {
                    offer_id: offer.id,
                    change,
                    project,
                },
            )
            .await?;
        tracing::info!(
            offer_id = %offer.id,
            project_id = ?offer.project_id,
            number = receipt.offer.offer_number.as_deref().unwrap_or("-"),
            expired = receipt.expired_siblings.len(),
            "Offer won"
        );
        Ok(TransitionOutcome {
            offer: receipt.offer,
            project: receipt.project,
            expired_siblings: receipt.expired_siblings,
        })
    }

    /// Expire every active offer of `project_id` except `winner`.
    ///
    /// Safe to repeat: a second call changes nothing.
    pub async fn expire_siblings(
        &self,
        scope: &TenantScope,
        project_id: ProjectId,
        winner: OfferId,
    ) -> EngineResult<Vec<OfferId>> {
        let expired = self
            .store
            .expire_sibling_offers(scope, project_id, winner, Utc::now())
            .await?;
        if !expired.is_empty() {
            tracing::info!(project_id = %project_id, count = expired.len(), "Expired sibling offers");
        }
        Ok(expired)
    }

    /// Change price and probability of an open offer.
    pub async fn update_pricing(
        &self,
        scope: &TenantScope,
        id: OfferId,
        value: Decimal,
        cost: Decimal,
        probability: u8,
    ) -> EngineResult<Offer> {
        check_probability(probability)?;
        let offer = self.get_offer(scope, id).await?;
        if offer.phase.is_terminal() {
            return Err(EngineError::InvalidInput(format!(
                "offer {id} is {} and can no longer be repriced",
                offer.phase
            )));
        }
        let updated = self
            .store
            .update_offer_pricing(
                scope,
                id,
                OfferPricing {
                    value,
                    cost,
                    probability,
                    updated_at: Utc::now(),
                },
            )
            .await?;
        if let Some(project_id) = updated.project_id {
            self.projects
                .recalculate_best_offer_economics(scope, project_id)
                .await?;
        }
        Ok(updated)
    }

    /// Link an offer to a project of the same company, or unlink it with
    /// `None`. Both the old and the new project are recalculated.
    pub async fn link_to_project(
        &self,
        scope: &TenantScope,
        id: OfferId,
        project_id: Option<ProjectId>,
    ) -> EngineResult<Offer> {
        let offer = self.get_offer(scope, id).await?;
        if let Some(project_id) = project_id {
            let project = self.projects.get_project(scope, project_id).await?;
            if project.company_id != offer.company_id {
                return Err(EngineError::InvalidInput(format!(
                    "project {project_id} belongs to another company"
                )));
            }
        }
        let updated = self
            .store
            .set_offer_project(scope, id, project_id, Utc::now())
            .await?;

        for affected in [offer.project_id, project_id].into_iter().flatten() {
            self.projects
                .recalculate_best_offer_economics(scope, affected)
                .await?;
        }
        Ok(updated)
    }

    /// Replace the number of a numbered offer. Drafts never carry numbers.
    pub async fn set_offer_number(
        &self,
        scope: &TenantScope,
        id: OfferId,
        number: &str,
    ) -> EngineResult<Offer> {
        let number = number.trim();
        if number.is_empty() {
            return Err(EngineError::InvalidInput("offer number cannot be empty".into()));
        }
        let offer = self.get_offer(scope, id).await?;
        if offer.phase == OfferPhase::Draft {
            return Err(EngineError::InvalidInput(
                "draft offers cannot carry an offer number".into(),
            ));
        }
        if !self
            .numbering
            .check_unique(number, &offer.company_id, Some(id))
            .await?
        {
            return Err(EngineError::Conflict(format!(
                "offer number {number} already used in {}",
                offer.company_id
            )));
        }
        Ok(self
            .store
            .set_offer_number(scope, id, number, Utc::now())
            .await?)
    }

    /// Set or clear the external reference. Empty strings clear it.
    pub async fn set_external_reference(
        &self,
        scope: &TenantScope,
        id: OfferId,
        reference: Option<&str>,
    ) -> EngineResult<Offer> {
        let offer = self.get_offer(scope, id).await?;
        let reference = reference.map(str::trim).filter(|r| !r.is_empty());
        if let Some(reference) = reference {
            if !self
                .numbering
                .check_external_reference_unique(reference, &offer.company_id, Some(id))
                .await?
            {
                return Err(EngineError::Conflict(format!(
                    "external reference {reference} already used in {}",
                    offer.company_id
                )));
            }
        }
        Ok(self
            .store
            .set_external_reference(scope, id, reference, Utc::now())
            .await?)
    }
}

fn check_probability(probability: u8) -> EngineResult<()> {
    if probability > 100 {
        return Err(EngineError::InvalidInput(format!(
            "probability {probability} outside 0..=100"
        )));
    }
    Ok(())
}

fn default_expiry(sent_at: DateTime<Utc>) -> DateTime<Utc> {
    sent_at + Duration::days(OFFER_VALIDITY_DAYS)
}

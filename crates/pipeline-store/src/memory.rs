//! In-memory reference implementation of the pipeline storage traits.
//!
//! Offers, projects, budget lines and the aggregate snapshot share one lock,
//! so each trait call (including a full offer win) is atomic. Counters use a
//! separate lock. This backend does not survive restarts and does not protect
//! counters across processes; use PostgreSQL for shared deployments.

use crate::model::{OfferPricing, OfferWin, WinReceipt};
use crate::traits::{AggregateStore, OfferStore, ProjectStore, SequenceStore, WorkflowStore};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_types::{
    aggregate_by_company, BudgetItem, BudgetParent, CompanyId, DateRange,
    MaterializedPipelineRow, Offer, OfferId, OfferPhase, OfferPhaseChange, PipelineOfferRow,
    Project, ProjectEconomics, ProjectId, ProjectPhase, SequenceCounter, TenantScope,
    WinningOffer,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

/// Same ceiling as the PostgreSQL `BIGINT` column.
const MAX_SEQUENCE_VALUE: u64 = i64::MAX as u64;

#[derive(Default)]
struct Records {
    offers: HashMap<OfferId, Offer>,
    projects: HashMap<ProjectId, Project>,
    budget_items: Vec<BudgetItem>,
    aggregate: Vec<MaterializedPipelineRow>,
}

impl Records {
    fn offer(&self, scope: &TenantScope, id: OfferId) -> Option<&Offer> {
        self.offers
            .get(&id)
            .filter(|o| scope.allows(&o.company_id))
    }

    fn offer_mut(&mut self, scope: &TenantScope, id: OfferId) -> StorageResult<&mut Offer> {
        self.offers
            .get_mut(&id)
            .filter(|o| scope.allows(&o.company_id))
            .ok_or_else(|| StorageError::NotFound(format!("offer {id} not found")))
    }

    fn project(&self, scope: &TenantScope, id: ProjectId) -> Option<&Project> {
        self.projects
            .get(&id)
            .filter(|p| scope.allows(&p.company_id))
    }

    fn project_mut(&mut self, scope: &TenantScope, id: ProjectId) -> StorageResult<&mut Project> {
        self.projects
            .get_mut(&id)
            .filter(|p| scope.allows(&p.company_id))
            .ok_or_else(|| StorageError::NotFound(format!("project {id} not found")))
    }

    fn number_taken(&self, company: &CompanyId, number: &str, exclude: Option<OfferId>) -> bool {
        self.offers.values().any(|o| {
            &o.company_id == company
                && Some(o.id) != exclude
                && o.offer_number.as_deref() == Some(number)
        })
    }

    fn reference_taken(&self, company: &CompanyId, reference: &str, exclude: Option<OfferId>) -> bool {
        !reference.is_empty()
            && self.offers.values().any(|o| {
                &o.company_id == company
                    && Some(o.id) != exclude
                    && o.external_reference.as_deref() == Some(reference)
            })
    }

    fn ensure_number_free(
        &self,
        company: &CompanyId,
        number: &str,
        exclude: Option<OfferId>,
    ) -> StorageResult<()> {
        if self.number_taken(company, number, exclude) {
            return Err(StorageError::Conflict(format!(
                "offer number {number} already used in {company}"
            )));
        }
        Ok(())
    }

    fn check_winner(&self, scope: &TenantScope, id: ProjectId) -> StorageResult<()> {
        let project = self
            .project(scope, id)
            .ok_or_else(|| StorageError::NotFound(format!("project {id} not found")))?;
        if let Some(existing) = project.winning_offer_id {
            return Err(StorageError::Conflict(format!(
                "project {id} already won by {existing}"
            )));
        }
        if project.phase != ProjectPhase::Tilbud {
            return Err(StorageError::InvalidTransition(format!(
                "project {id} is {} and cannot take a winning offer",
                project.phase
            )));
        }
        Ok(())
    }

    fn adopt(&mut self, scope: &TenantScope, id: ProjectId, winner: &WinningOffer) -> StorageResult<Project> {
        self.check_winner(scope, id)?;
        let project = self.project_mut(scope, id)?;
        winner.adopt_into(project);
        Ok(project.clone())
    }

    fn expire_siblings(
        &mut self,
        scope: &TenantScope,
        project_id: ProjectId,
        winner: OfferId,
        at: DateTime<Utc>,
    ) -> Vec<OfferId> {
        let mut expired = Vec::new();
        for offer in self.offers.values_mut() {
            if offer.project_id == Some(project_id)
                && offer.id != winner
                && offer.phase.is_active()
                && scope.allows(&offer.company_id)
            {
                offer.phase = OfferPhase::Expired;
                offer.closed_at.get_or_insert(at);
                offer.updated_at = at;
                expired.push(offer.id);
            }
        }
        expired.sort();
        expired
    }
}

/// In-memory pipeline storage adapter.
#[derive(Default)]
pub struct InMemoryPipelineStore {
    sequences: Mutex<BTreeMap<(CompanyId, i32), SequenceCounter>>,
    records: RwLock<Records>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, Records>> {
        self.records
            .read()
            .map_err(|_| StorageError::Backend("records lock poisoned".to_string()))
    }

    fn write(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, Records>> {
        self.records
            .write()
            .map_err(|_| StorageError::Backend("records lock poisoned".to_string()))
    }

    fn counters(
        &self,
    ) -> StorageResult<std::sync::MutexGuard<'_, BTreeMap<(CompanyId, i32), SequenceCounter>>> {
        self.sequences
            .lock()
            .map_err(|_| StorageError::Backend("sequence lock poisoned".to_string()))
    }
}

#[async_trait]
impl SequenceStore for InMemoryPipelineStore {
    async fn next_sequence_value(&self, company: &CompanyId, year: i32) -> StorageResult<u64> {
        let mut guard = self.counters()?;
        let counter = guard
            .entry((company.clone(), year))
            .or_insert_with(|| SequenceCounter {
                company_id: company.clone(),
                year,
                last_value: 0,
                updated_at: Utc::now(),
            });
        counter.last_value = counter.last_value.checked_add(1).ok_or_else(|| {
            StorageError::InvalidInput(format!("sequence exhausted for {company} {year}"))
        })?;
        counter.updated_at = Utc::now();
        Ok(counter.last_value)
    }

    async fn raise_sequence_floor(
        &self,
        company: &CompanyId,
        year: i32,
        value: u64,
    ) -> StorageResult<u64> {
        if value > MAX_SEQUENCE_VALUE {
            return Err(StorageError::InvalidInput(format!(
                "sequence value {value} too large"
            )));
        }
        let mut guard = self.counters()?;
        let counter = guard
            .entry((company.clone(), year))
            .or_insert_with(|| SequenceCounter {
                company_id: company.clone(),
                year,
                last_value: 0,
                updated_at: Utc::now(),
            });
        if value > counter.last_value {
            counter.last_value = value;
            counter.updated_at = Utc::now();
        }
        Ok(counter.last_value)
    }

    async fn current_sequence_value(&self, company: &CompanyId, year: i32) -> StorageResult<u64> {
        let guard = self.counters()?;
        Ok(guard
            .get(&(company.clone(), year))
            .map_or(0, |c| c.last_value))
    }

    async fn list_sequences(&self, scope: &TenantScope) -> StorageResult<Vec<SequenceCounter>> {
        let guard = self.counters()?;
        let mut out: Vec<_> = guard
            .values()
            .filter(|c| scope.allows(&c.company_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.company_id
                .cmp(&b.company_id)
                .then_with(|| b.year.cmp(&a.year))
        });
        Ok(out)
    }
}

#[async_trait]
impl OfferStore for InMemoryPipelineStore {
    async fn insert_offer(&self, offer: &Offer) -> StorageResult<()> {
        offer
            .validate()
            .map_err(|e| StorageError::InvalidInput(e.to_string()))?;
        let mut guard = self.write()?;
        if guard.offers.contains_key(&offer.id) {
            return Err(StorageError::Conflict(format!("offer {} already exists", offer.id)));
        }
        if let Some(number) = &offer.offer_number {
            guard.ensure_number_free(&offer.company_id, number, None)?;
        }
        if let Some(reference) = &offer.external_reference {
            if guard.reference_taken(&offer.company_id, reference, None) {
                return Err(StorageError::Conflict(format!(
                    "external reference {reference} already used in {}",
                    offer.company_id
                )));
            }
        }
        guard.offers.insert(offer.id, offer.clone());
        Ok(())
    }

    async fn get_offer(&self, scope: &TenantScope, id: OfferId) -> StorageResult<Option<Offer>> {
        Ok(self.read()?.offer(scope, id).cloned())
    }

    async fn list_project_offers(
        &self,
        scope: &TenantScope,
        project_id: ProjectId,
    ) -> StorageResult<Vec<Offer>> {
        let guard = self.read()?;
        let mut out: Vec<_> = guard
            .offers
            .values()
            .filter(|o| o.project_id == Some(project_id) && scope.allows(&o.company_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn offer_number_exists(
        &self,
        company: &CompanyId,
        number: &str,
        exclude: Option<OfferId>,
    ) -> StorageResult<bool> {
        Ok(self.read()?.number_taken(company, number, exclude))
    }

    async fn external_reference_exists(
        &self,
        company: &CompanyId,
        reference: &str,
        exclude: Option<OfferId>,
    ) -> StorageResult<bool> {
        Ok(self.read()?.reference_taken(company, reference, exclude))
    }

    async fn update_offer_pricing(
        &self,
        scope: &TenantScope,
        id: OfferId,
        pricing: OfferPricing,
    ) -> StorageResult<Offer> {
        if pricing.probability > 100 {
            return Err(StorageError::InvalidInput(format!(
                "probability {} outside 0..=100",
                pricing.probability
            )));
        }
        let mut guard = self.write()?;
        let offer = guard.offer_mut(scope, id)?;
        offer.value = pricing.value;
        offer.cost = pricing.cost;
        offer.probability = pricing.probability;
        offer.updated_at = pricing.updated_at;
        Ok(offer.clone())
    }

    async fn set_offer_number(
        &self,
        scope: &TenantScope,
        id: OfferId,
        number: &str,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<Offer> {
        let mut guard = self.write()?;
        let company = guard
            .offer(scope, id)
            .map(|o| o.company_id.clone())
            .ok_or_else(|| StorageError::NotFound(format!("offer {id} not found")))?;
        guard.ensure_number_free(&company, number, Some(id))?;
        let offer = guard.offer_mut(scope, id)?;
        offer.offer_number = Some(number.to_string());
        offer.updated_at = updated_at;
        Ok(offer.clone())
    }

    async fn set_external_reference(
        &self,
        scope: &TenantScope,
        id: OfferId,
        reference: Option<&str>,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<Offer> {
        let reference = reference.filter(|r| !r.is_empty());
        let mut guard = self.write()?;
        let company = guard
            .offer(scope, id)
            .map(|o| o.company_id.clone())
            .ok_or_else(|| StorageError::NotFound(format!("offer {id} not found")))?;
        if let Some(r) = reference {
            if guard.reference_taken(&company, r, Some(id)) {
                return Err(StorageError::Conflict(format!(
                    "external reference {r} already used in {company}"
                )));
            }
        }
        let offer = guard.offer_mut(scope, id)?;
        offer.external_reference = reference.map(str::to_string);
        offer.updated_at = updated_at;
        Ok(offer.clone())
    }

    async fn set_offer_project(
        &self,
        scope: &TenantScope,
        id: OfferId,
        project_id: Option<ProjectId>,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<Offer> {
        let mut guard = self.write()?;
        let company = guard
            .offer(scope, id)
            .map(|o| o.company_id.clone())
            .ok_or_else(|| StorageError::NotFound(format!("offer {id} not found")))?;
        if let Some(pid) = project_id {
            let same_company = TenantScope::Company(company);
            if guard.project(&same_company, pid).is_none() {
                return Err(StorageError::NotFound(format!("project {pid} not found")));
            }
        }
        let offer = guard.offer_mut(scope, id)?;
        offer.project_id = project_id;
        offer.updated_at = updated_at;
        Ok(offer.clone())
    }

    async fn transition_offer(
        &self,
        scope: &TenantScope,
        id: OfferId,
        expected_from: OfferPhase,
        change: &OfferPhaseChange,
    ) -> StorageResult<Offer> {
        let mut guard = self.write()?;
        let (company, phase) = guard
            .offer(scope, id)
            .map(|o| (o.company_id.clone(), o.phase))
            .ok_or_else(|| StorageError::NotFound(format!("offer {id} not found")))?;
        if phase != expected_from {
            return Err(StorageError::InvalidTransition(format!(
                "offer {id} is {phase}, expected {expected_from}"
            )));
        }
        if let Some(number) = &change.offer_number {
            guard.ensure_number_free(&company, number, Some(id))?;
        }
        let offer = guard.offer_mut(scope, id)?;
        change.apply(offer);
        Ok(offer.clone())
    }

    async fn append_offer_number_suffix(
        &self,
        scope: &TenantScope,
        id: OfferId,
        suffix: &str,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<String> {
        let mut guard = self.write()?;
        let (company, current) = guard
            .offer(scope, id)
            .map(|o| (o.company_id.clone(), o.offer_number.clone()))
            .ok_or_else(|| StorageError::NotFound(format!("offer {id} not found")))?;
        let current = current.ok_or_else(|| {
            StorageError::InvalidInput(format!("offer {id} has no number to suffix"))
        })?;
        let updated = format!("{current}{suffix}");
        guard.ensure_number_free(&company, &updated, Some(id))?;
        let offer = guard.offer_mut(scope, id)?;
        offer.offer_number = Some(updated.clone());
        offer.updated_at = updated_at;
        Ok(updated)
    }

    async fn expire_sibling_offers(
        &self,
        scope: &TenantScope,
        project_id: ProjectId,
        winner: OfferId,
        at: DateTime<Utc>,
    ) -> StorageResult<Vec<OfferId>> {
        Ok(self.write()?.expire_siblings(scope, project_id, winner, at))
    }

    async fn list_pipeline_offers(
        &self,
        scope: &TenantScope,
        range: &DateRange,
    ) -> StorageResult<Vec<PipelineOfferRow>> {
        let guard = self.read()?;
        Ok(guard
            .offers
            .values()
            .filter(|o| {
                o.phase.is_pipeline() && scope.allows(&o.company_id) && range.contains(o.created_at)
            })
            .map(PipelineOfferRow::from)
            .collect())
    }
}

#[async_trait]
impl ProjectStore for InMemoryPipelineStore {
    async fn insert_project(&self, project: &Project) -> StorageResult<()> {
        project
            .validate()
            .map_err(|e| StorageError::InvalidInput(e.to_string()))?;
        let mut guard = self.write()?;
        if guard.projects.contains_key(&project.id) {
            return Err(StorageError::Conflict(format!(
                "project {} already exists",
                project.id
            )));
        }
        guard.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(
        &self,
        scope: &TenantScope,
        id: ProjectId,
    ) -> StorageResult<Option<Project>> {
        Ok(self.read()?.project(scope, id).cloned())
    }

    async fn update_project_economics(
        &self,
        scope: &TenantScope,
        id: ProjectId,
        economics: &ProjectEconomics,
    ) -> StorageResult<bool> {
        let mut guard = self.write()?;
        let project = guard.project_mut(scope, id)?;
        if project.phase != ProjectPhase::Tilbud {
            return Ok(false);
        }
        economics.apply(project);
        Ok(true)
    }

    async fn set_winning_offer(
        &self,
        scope: &TenantScope,
        id: ProjectId,
        winner: &WinningOffer,
    ) -> StorageResult<Project> {
        self.write()?.adopt(scope, id, winner)
    }

    async fn change_project_phase(
        &self,
        scope: &TenantScope,
        id: ProjectId,
        expected_from: ProjectPhase,
        to: ProjectPhase,
        at: DateTime<Utc>,
    ) -> StorageResult<Project> {
        let mut guard = self.write()?;
        let project = guard.project_mut(scope, id)?;
        if project.phase != expected_from {
            return Err(StorageError::InvalidTransition(format!(
                "project {id} is {}, expected {expected_from}",
                project.phase
            )));
        }
        project.phase = to;
        project.updated_at = at;
        Ok(project.clone())
    }

    async fn insert_budget_item(&self, item: &BudgetItem) -> StorageResult<()> {
        let mut guard = self.write()?;
        if guard.budget_items.iter().any(|b| b.id == item.id) {
            return Err(StorageError::Conflict(format!(
                "budget item {} already exists",
                item.id
            )));
        }
        guard.budget_items.push(item.clone());
        Ok(())
    }

    async fn list_budget_items(
        &self,
        scope: &TenantScope,
        parent: BudgetParent,
    ) -> StorageResult<Vec<BudgetItem>> {
        let guard = self.read()?;
        Ok(guard
            .budget_items
            .iter()
            .filter(|b| b.parent == parent && scope.allows(&b.company_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WorkflowStore for InMemoryPipelineStore {
    async fn commit_offer_win(
        &self,
        scope: &TenantScope,
        win: &OfferWin,
    ) -> StorageResult<WinReceipt> {
        let mut guard = self.write()?;

        // Validate everything before the first mutation.
        let (company, phase, linked) = guard
            .offer(scope, win.offer_id)
            .map(|o| (o.company_id.clone(), o.phase, o.project_id))
            .ok_or_else(|| StorageError::NotFound(format!("offer {} not found", win.offer_id)))?;
        if phase != OfferPhase::Sent {
            return Err(StorageError::InvalidTransition(format!(
                "offer {} is {phase}, expected {}",
                win.offer_id,
                OfferPhase::Sent
            )));
        }
        if linked != win.project.as_ref().map(|pw| pw.project_id) {
            return Err(StorageError::Conflict(format!(
                "offer {} was relinked during the win",
                win.offer_id
            )));
        }
        if let Some(number) = &win.change.offer_number {
            guard.ensure_number_free(&company, number, Some(win.offer_id))?;
        }
        if let Some(project) = &win.project {
            guard.check_winner(scope, project.project_id)?;
        }

        let offer = guard.offer_mut(scope, win.offer_id)?;
        win.change.apply(offer);
        let offer = offer.clone();

        let (project, expired_siblings) = match &win.project {
            Some(pw) => {
                let project = guard.adopt(scope, pw.project_id, &pw.adoption)?;
                let expired =
                    guard.expire_siblings(scope, pw.project_id, win.offer_id, win.change.updated_at);
                (Some(project), expired)
            }
            None => (None, Vec::new()),
        };

        Ok(WinReceipt {
            offer,
            project,
            expired_siblings,
        })
    }
}

#[async_trait]
impl AggregateStore for InMemoryPipelineStore {
    async fn refresh_pipeline_aggregate(&self) -> StorageResult<usize> {
        let mut guard = self.write()?;
        let rows: Vec<PipelineOfferRow> = guard.offers.values().map(PipelineOfferRow::from).collect();
        guard.aggregate = aggregate_by_company(&rows);
        Ok(guard.aggregate.len())
    }

    async fn materialized_pipeline_rows(
        &self,
        scope: &TenantScope,
    ) -> StorageResult<Vec<MaterializedPipelineRow>> {
        let guard = self.read()?;
        Ok(guard
            .aggregate
            .iter()
            .filter(|r| scope.allows(&r.company_id))
            .cloned()
            .collect())
    }
}

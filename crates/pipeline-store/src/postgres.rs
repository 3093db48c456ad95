//! PostgreSQL adapter for pipeline storage.
//!
//! Counters are row-locked (`SELECT ... FOR UPDATE`) under a bounded
//! `lock_timeout`. Offer wins run in one transaction guarded by a
//! compare-and-swap on `projects.winning_offer_id`. The all-time dashboard
//! reads `dashboard_metrics_aggregation`, a materialized view refreshed on
//! demand.

use crate::model::{OfferPricing, OfferWin, WinReceipt};
use crate::traits::{AggregateStore, OfferStore, ProjectStore, SequenceStore, WorkflowStore};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_types::{
    BudgetItem, BudgetItemId, BudgetParent, CompanyId, CustomerId, CustomerUpdate, DateRange,
    LossReasonCategory, MaterializedPipelineRow, Offer, OfferId, OfferPhase, OfferPhaseChange,
    PhaseTotals, PipelineOfferRow, Project, ProjectEconomics, ProjectId, ProjectPhase,
    SequenceCounter, TenantScope, UserId, WinningOffer,
};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Acquire, Postgres, Row};
use uuid::Uuid;

const OFFER_COLUMNS: &str = "id, company_id, project_id, customer_id, customer_name, title, \
     phase, value, cost, probability, offer_number, external_reference, responsible_user_id, \
     responsible_user_name, description, location, sent_at, expires_at, closed_at, \
     loss_reason_category, loss_reason, created_at, updated_at";

const PROJECT_COLUMNS: &str = "id, company_id, name, project_number, phase, value, cost, \
     budget, spent, has_detailed_budget, customer_id, customer_name, manager_id, manager_name, \
     description, location, winning_offer_id, won_at, created_at, updated_at";

const PIPELINE_PHASES_SQL: &str = "('in_progress', 'sent', 'order', 'completed', 'lost')";

const ACTIVE_PHASES_SQL: &str = "('draft', 'in_progress', 'sent')";

/// PostgreSQL-backed pipeline storage.
#[derive(Clone)]
pub struct PostgresPipelineStore {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PostgresPipelineStore {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5, 5_000).await
    }

    /// Connect with explicit pool and lock-wait parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
        lock_timeout_ms: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool, lock_timeout_ms).await
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool, lock_timeout_ms: u64) -> StorageResult<Self> {
        let store = Self {
            pool,
            lock_timeout_ms,
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS number_sequences (
                company_id TEXT NOT NULL,
                year INTEGER NOT NULL,
                last_value BIGINT NOT NULL CHECK (last_value >= 0),
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (company_id, year)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id UUID PRIMARY KEY,
                company_id TEXT NOT NULL,
                name TEXT NOT NULL,
                project_number TEXT NOT NULL,
                phase TEXT NOT NULL,
                value NUMERIC NOT NULL DEFAULT 0,
                cost NUMERIC NOT NULL DEFAULT 0,
                budget NUMERIC NOT NULL DEFAULT 0,
                spent NUMERIC NOT NULL DEFAULT 0,
                has_detailed_budget BOOLEAN NOT NULL DEFAULT FALSE,
                customer_id UUID,
                customer_name TEXT,
                manager_id TEXT,
                manager_name TEXT,
                description TEXT,
                location TEXT,
                winning_offer_id UUID,
                won_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_company_number
                ON projects(company_id, project_number)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS offers (
                id UUID PRIMARY KEY,
                company_id TEXT NOT NULL,
                project_id UUID REFERENCES projects(id),
                customer_id UUID,
                customer_name TEXT,
                title TEXT NOT NULL,
                phase TEXT NOT NULL,
                value NUMERIC NOT NULL DEFAULT 0,
                cost NUMERIC NOT NULL DEFAULT 0,
                probability SMALLINT NOT NULL CHECK (probability BETWEEN 0 AND 100),
                offer_number TEXT,
                external_reference TEXT,
                responsible_user_id TEXT,
                responsible_user_name TEXT,
                description TEXT,
                location TEXT,
                sent_at TIMESTAMPTZ,
                expires_at TIMESTAMPTZ,
                closed_at TIMESTAMPTZ,
                loss_reason_category TEXT,
                loss_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_offers_company_number
                ON offers(company_id, offer_number)
                WHERE offer_number IS NOT NULL
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_offers_company_external_ref
                ON offers(company_id, external_reference)
                WHERE external_reference IS NOT NULL AND external_reference <> ''
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_offers_project
                ON offers(project_id)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_offers_company_created
                ON offers(company_id, created_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS budget_items (
                id UUID PRIMARY KEY,
                company_id TEXT NOT NULL,
                parent_kind TEXT NOT NULL CHECK (parent_kind IN ('offer', 'project')),
                parent_id UUID NOT NULL,
                name TEXT NOT NULL,
                expected_cost NUMERIC NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_budget_items_parent
                ON budget_items(parent_kind, parent_id)
            "#,
            r#"
            CREATE MATERIALIZED VIEW IF NOT EXISTS dashboard_metrics_aggregation AS
            WITH ranked AS (
                SELECT company_id, phase, value, probability,
                       ROW_NUMBER() OVER (
                           PARTITION BY company_id, phase, project_id
                           ORDER BY value DESC, id ASC
                       ) AS rank_in_group,
                       COUNT(*) OVER (PARTITION BY company_id, phase, project_id) AS group_size
                  FROM offers
                 WHERE project_id IS NOT NULL
                   AND phase IN ('in_progress', 'sent', 'order', 'completed', 'lost')
            ),
            groups AS (
                SELECT company_id, phase, value, probability, group_size AS offer_count
                  FROM ranked
                 WHERE rank_in_group = 1
                UNION ALL
                SELECT company_id, phase, value, probability, 1 AS offer_count
                  FROM offers
                 WHERE project_id IS NULL
                   AND phase IN ('in_progress', 'sent', 'order', 'completed', 'lost')
            )
            SELECT company_id,
                   phase,
                   COUNT(*)::BIGINT AS project_count,
                   SUM(offer_count)::BIGINT AS offer_count,
                   COALESCE(SUM(value), 0) AS total_value,
                   COALESCE(SUM(value * probability / 100.0), 0) AS weighted_value
              FROM groups
             GROUP BY company_id, phase
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_dashboard_metrics_company_phase
                ON dashboard_metrics_aggregation(company_id, phase)
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }

        Ok(())
    }

    async fn set_lock_timeout(&self, conn: &mut PgConnection) -> StorageResult<()> {
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout_ms))
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// One locked read-modify-write of a counter. A lost creation race
    /// surfaces as `Conflict`.
    async fn try_next_sequence(&self, company: &CompanyId, year: i32) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let conn = tx.acquire().await.map_err(map_sqlx_error)?;
        self.set_lock_timeout(conn).await?;

        let locked = sqlx::query(
            "SELECT last_value FROM number_sequences WHERE company_id = $1 AND year = $2 FOR UPDATE",
        )
        .bind(company.as_str())
        .bind(year)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

        let next = match locked {
            Some(row) => {
                let last: i64 = column(&row, "last_value")?;
                let next = last.checked_add(1).ok_or_else(|| {
                    StorageError::InvalidInput(format!("sequence exhausted for {company} {year}"))
                })?;
                sqlx::query(
                    r#"
                    UPDATE number_sequences
                       SET last_value = $3, updated_at = now()
                     WHERE company_id = $1 AND year = $2
                    "#,
                )
                .bind(company.as_str())
                .bind(year)
                .bind(next)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
                next
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO number_sequences (company_id, year, last_value, updated_at)
                    VALUES ($1, $2, 1, now())
                    "#,
                )
                .bind(company.as_str())
                .bind(year)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
                1
            }
        };

        tx.commit().await.map_err(map_sqlx_error)?;
        to_u64(next, "last_value")
    }

    async fn offer_phase(
        &self,
        scope: &TenantScope,
        id: OfferId,
    ) -> StorageResult<Option<OfferPhase>> {
        Ok(self.get_offer(scope, id).await?.map(|o| o.phase))
    }

    /// Explain why a conditional offer update matched no row.
    async fn offer_miss(
        &self,
        scope: &TenantScope,
        id: OfferId,
        expected: OfferPhase,
    ) -> StorageError {
        match self.offer_phase(scope, id).await {
            Ok(Some(phase)) => StorageError::InvalidTransition(format!(
                "offer {id} is {phase}, expected {expected}"
            )),
            Ok(None) => StorageError::NotFound(format!("offer {id} not found")),
            Err(e) => e,
        }
    }

    /// Explain why the winning offer's update matched no row.
    async fn win_miss(
        &self,
        scope: &TenantScope,
        id: OfferId,
        expected_project: Option<ProjectId>,
    ) -> StorageError {
        match self.get_offer(scope, id).await {
            Ok(Some(offer))
                if offer.phase == OfferPhase::Sent && offer.project_id != expected_project =>
            {
                StorageError::Conflict(format!("offer {id} was relinked during the win"))
            }
            Ok(_) => self.offer_miss(scope, id, OfferPhase::Sent).await,
            Err(e) => e,
        }
    }

    /// Explain why the winner compare-and-swap matched no row.
    async fn winner_miss(&self, scope: &TenantScope, id: ProjectId) -> StorageError {
        match self.get_project(scope, id).await {
            Ok(Some(p)) => match p.winning_offer_id {
                Some(existing) => {
                    StorageError::Conflict(format!("project {id} already won by {existing}"))
                }
                None => StorageError::InvalidTransition(format!(
                    "project {id} is {} and cannot take a winning offer",
                    p.phase
                )),
            },
            Ok(None) => StorageError::NotFound(format!("project {id} not found")),
            Err(e) => e,
        }
    }
}

/// Conditional phase update. With `expected_project` set, the offer must
/// also still be linked to that project (`Some(None)` means unlinked).
async fn apply_phase_change(
    conn: &mut PgConnection,
    scope: &TenantScope,
    id: OfferId,
    expected_from: OfferPhase,
    expected_project: Option<Option<ProjectId>>,
    change: &OfferPhaseChange,
) -> StorageResult<Option<Offer>> {
    let sql = format!(
        r#"
        UPDATE offers
           SET phase = $1,
               probability = COALESCE($2, probability),
               offer_number = COALESCE($3, offer_number),
               sent_at = COALESCE($4, sent_at),
               expires_at = COALESCE($5, expires_at),
               closed_at = COALESCE($6, closed_at),
               loss_reason_category = COALESCE($7, loss_reason_category),
               loss_reason = COALESCE($8, loss_reason),
               updated_at = $9
         WHERE id = $10
           AND phase = $11
           AND ($12::TEXT IS NULL OR company_id = $12)
           AND (NOT $13::BOOLEAN OR project_id IS NOT DISTINCT FROM $14::UUID)
        RETURNING {OFFER_COLUMNS}
        "#
    );
    let row = sqlx::query(&sql)
        .bind(change.to.as_str())
        .bind(change.probability.map(i16::from))
        .bind(change.offer_number.as_deref())
        .bind(change.sent_at)
        .bind(change.expires_at)
        .bind(change.closed_at)
        .bind(change.loss_reason_category.map(LossReasonCategory::as_str))
        .bind(change.loss_reason.as_deref())
        .bind(change.updated_at)
        .bind(id.as_uuid())
        .bind(expected_from.as_str())
        .bind(scope.filter().map(CompanyId::as_str))
        .bind(expected_project.is_some())
        .bind(expected_project.flatten().map(|p| *p.as_uuid()))
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    row.as_ref().map(row_to_offer).transpose()
}

async fn adopt_winner(
    conn: &mut PgConnection,
    scope: &TenantScope,
    id: ProjectId,
    winner: &WinningOffer,
) -> StorageResult<Option<Project>> {
    let sql = format!(
        r#"
        UPDATE projects
           SET phase = 'active',
               winning_offer_id = $1,
               won_at = $2,
               value = $3,
               cost = $4,
               customer_id = $5,
               customer_name = $6,
               manager_name = CASE WHEN manager_id IS NULL THEN $8 ELSE manager_name END,
               manager_id = COALESCE(manager_id, $7),
               description = CASE WHEN COALESCE(btrim(description), '') = '' THEN $9 ELSE description END,
               location = CASE WHEN COALESCE(btrim(location), '') = '' THEN $10 ELSE location END,
               updated_at = $2
         WHERE id = $11
           AND winning_offer_id IS NULL
           AND phase = 'tilbud'
           AND ($12::TEXT IS NULL OR company_id = $12)
        RETURNING {PROJECT_COLUMNS}
        "#
    );
    let row = sqlx::query(&sql)
        .bind(winner.offer_id.as_uuid())
        .bind(winner.won_at)
        .bind(winner.value)
        .bind(winner.cost)
        .bind(winner.customer_id.map(|c| *c.as_uuid()))
        .bind(winner.customer_name.as_deref())
        .bind(winner.manager_id.as_ref().map(UserId::as_str))
        .bind(winner.manager_name.as_deref())
        .bind(winner.description.as_deref())
        .bind(winner.location.as_deref())
        .bind(id.as_uuid())
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    row.as_ref().map(row_to_project).transpose()
}

async fn expire_siblings(
    conn: &mut PgConnection,
    scope: &TenantScope,
    project_id: ProjectId,
    winner: OfferId,
    at: DateTime<Utc>,
) -> StorageResult<Vec<OfferId>> {
    let sql = format!(
        r#"
        UPDATE offers
           SET phase = 'expired',
               closed_at = COALESCE(closed_at, $1),
               updated_at = $1
         WHERE project_id = $2
           AND id <> $3
           AND phase IN {ACTIVE_PHASES_SQL}
           AND ($4::TEXT IS NULL OR company_id = $4)
        RETURNING id
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(at)
        .bind(project_id.as_uuid())
        .bind(winner.as_uuid())
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_all(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    let mut ids = rows
        .iter()
        .map(|r| column::<Uuid>(r, "id").map(OfferId::from_uuid))
        .collect::<StorageResult<Vec<_>>>()?;
    ids.sort();
    Ok(ids)
}

#[async_trait]
impl SequenceStore for PostgresPipelineStore {
    async fn next_sequence_value(&self, company: &CompanyId, year: i32) -> StorageResult<u64> {
        match self.try_next_sequence(company, year).await {
            Err(StorageError::Conflict(_)) => {
                tracing::debug!(company = %company, year, "Lost counter creation race, retrying increment");
                self.try_next_sequence(company, year).await
            }
            other => other,
        }
    }

    async fn raise_sequence_floor(
        &self,
        company: &CompanyId,
        year: i32,
        value: u64,
    ) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let conn = tx.acquire().await.map_err(map_sqlx_error)?;
        self.set_lock_timeout(conn).await?;

        let row = sqlx::query(
            r#"
            INSERT INTO number_sequences (company_id, year, last_value, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (company_id, year) DO UPDATE
               SET last_value = GREATEST(number_sequences.last_value, EXCLUDED.last_value),
                   updated_at = CASE
                        WHEN EXCLUDED.last_value > number_sequences.last_value THEN now()
                        ELSE number_sequences.updated_at
                   END
            RETURNING last_value
            "#,
        )
        .bind(company.as_str())
        .bind(year)
        .bind(to_i64(value)?)
        .fetch_one(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        to_u64(column(&row, "last_value")?, "last_value")
    }

    async fn current_sequence_value(&self, company: &CompanyId, year: i32) -> StorageResult<u64> {
        let row = sqlx::query(
            "SELECT last_value FROM number_sequences WHERE company_id = $1 AND year = $2",
        )
        .bind(company.as_str())
        .bind(year)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        match row {
            Some(row) => to_u64(column(&row, "last_value")?, "last_value"),
            None => Ok(0),
        }
    }

    async fn list_sequences(&self, scope: &TenantScope) -> StorageResult<Vec<SequenceCounter>> {
        let rows = sqlx::query(
            r#"
            SELECT company_id, year, last_value, updated_at
              FROM number_sequences
             WHERE ($1::TEXT IS NULL OR company_id = $1)
             ORDER BY company_id ASC, year DESC
            "#,
        )
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| -> StorageResult<SequenceCounter> {
                Ok(SequenceCounter {
                    company_id: CompanyId::new(column::<String>(row, "company_id")?),
                    year: column(row, "year")?,
                    last_value: to_u64(column(row, "last_value")?, "last_value")?,
                    updated_at: column(row, "updated_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl OfferStore for PostgresPipelineStore {
    async fn insert_offer(&self, offer: &Offer) -> StorageResult<()> {
        offer
            .validate()
            .map_err(|e| StorageError::InvalidInput(e.to_string()))?;
        sqlx::query(&format!(
            "INSERT INTO offers ({OFFER_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, \
              $19, $20, $21, $22, $23)"
        ))
        .bind(offer.id.as_uuid())
        .bind(offer.company_id.as_str())
        .bind(offer.project_id.map(|p| *p.as_uuid()))
        .bind(offer.customer_id.map(|c| *c.as_uuid()))
        .bind(offer.customer_name.as_deref())
        .bind(&offer.title)
        .bind(offer.phase.as_str())
        .bind(offer.value)
        .bind(offer.cost)
        .bind(i16::from(offer.probability))
        .bind(offer.offer_number.as_deref())
        .bind(offer.external_reference.as_deref())
        .bind(offer.responsible_user_id.as_ref().map(UserId::as_str))
        .bind(offer.responsible_user_name.as_deref())
        .bind(offer.description.as_deref())
        .bind(offer.location.as_deref())
        .bind(offer.sent_at)
        .bind(offer.expires_at)
        .bind(offer.closed_at)
        .bind(offer.loss_reason_category.map(LossReasonCategory::as_str))
        .bind(offer.loss_reason.as_deref())
        .bind(offer.created_at)
        .bind(offer.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_offer(&self, scope: &TenantScope, id: OfferId) -> StorageResult<Option<Offer>> {
        let row = sqlx::query(&format!(
            "SELECT {OFFER_COLUMNS} FROM offers WHERE id = $1 AND ($2::TEXT IS NULL OR company_id = $2)"
        ))
        .bind(id.as_uuid())
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.as_ref().map(row_to_offer).transpose()
    }

    async fn list_project_offers(
        &self,
        scope: &TenantScope,
        project_id: ProjectId,
    ) -> StorageResult<Vec<Offer>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OFFER_COLUMNS}
              FROM offers
             WHERE project_id = $1
               AND ($2::TEXT IS NULL OR company_id = $2)
             ORDER BY value DESC, id ASC
            "#
        ))
        .bind(project_id.as_uuid())
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(row_to_offer).collect()
    }

    async fn offer_number_exists(
        &self,
        company: &CompanyId,
        number: &str,
        exclude: Option<OfferId>,
    ) -> StorageResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM offers
                 WHERE company_id = $1
                   AND offer_number = $2
                   AND ($3::UUID IS NULL OR id <> $3)
            ) AS taken
            "#,
        )
        .bind(company.as_str())
        .bind(number)
        .bind(exclude.map(|id| *id.as_uuid()))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        column(&row, "taken")
    }

    async fn external_reference_exists(
        &self,
        company: &CompanyId,
        reference: &str,
        exclude: Option<OfferId>,
    ) -> StorageResult<bool> {
        if reference.is_empty() {
            return Ok(false);
        }
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM offers
                 WHERE company_id = $1
                   AND external_reference = $2
                   AND ($3::UUID IS NULL OR id <> $3)
            ) AS taken
            "#,
        )
        .bind(company.as_str())
        .bind(reference)
        .bind(exclude.map(|id| *id.as_uuid()))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        column(&row, "taken")
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
        let row = sqlx::query(&format!(
            r#"
            UPDATE offers
               SET value = $1, cost = $2, probability = $3, updated_at = $4
             WHERE id = $5 AND ($6::TEXT IS NULL OR company_id = $6)
            RETURNING {OFFER_COLUMNS}
            "#
        ))
        .bind(pricing.value)
        .bind(pricing.cost)
        .bind(i16::from(pricing.probability))
        .bind(pricing.updated_at)
        .bind(id.as_uuid())
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        match row {
            Some(row) => row_to_offer(&row),
            None => Err(StorageError::NotFound(format!("offer {id} not found"))),
        }
    }

    async fn set_offer_number(
        &self,
        scope: &TenantScope,
        id: OfferId,
        number: &str,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<Offer> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE offers
               SET offer_number = $1, updated_at = $2
             WHERE id = $3 AND ($4::TEXT IS NULL OR company_id = $4)
            RETURNING {OFFER_COLUMNS}
            "#
        ))
        .bind(number)
        .bind(updated_at)
        .bind(id.as_uuid())
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        match row {
            Some(row) => row_to_offer(&row),
            None => Err(StorageError::NotFound(format!("offer {id} not found"))),
        }
    }

    async fn set_external_reference(
        &self,
        scope: &TenantScope,
        id: OfferId,
        reference: Option<&str>,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<Offer> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE offers
               SET external_reference = NULLIF($1, ''), updated_at = $2
             WHERE id = $3 AND ($4::TEXT IS NULL OR company_id = $4)
            RETURNING {OFFER_COLUMNS}
            "#
        ))
        .bind(reference)
        .bind(updated_at)
        .bind(id.as_uuid())
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        match row {
            Some(row) => row_to_offer(&row),
            None => Err(StorageError::NotFound(format!("offer {id} not found"))),
        }
    }

    async fn set_offer_project(
        &self,
        scope: &TenantScope,
        id: OfferId,
        project_id: Option<ProjectId>,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<Offer> {
        // The project must belong to the offer's own company.
        let row = sqlx::query(&format!(
            r#"
            UPDATE offers o
               SET project_id = $1, updated_at = $2
             WHERE o.id = $3
               AND ($4::TEXT IS NULL OR o.company_id = $4)
               AND ($1::UUID IS NULL OR EXISTS (
                    SELECT 1 FROM projects p WHERE p.id = $1 AND p.company_id = o.company_id
               ))
            RETURNING {OFFER_COLUMNS}
            "#
        ))
        .bind(project_id.map(|p| *p.as_uuid()))
        .bind(updated_at)
        .bind(id.as_uuid())
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        match row {
            Some(row) => row_to_offer(&row),
            None => match (self.get_offer(scope, id).await?, project_id) {
                (Some(_), Some(pid)) => Err(StorageError::NotFound(format!("project {pid} not found"))),
                _ => Err(StorageError::NotFound(format!("offer {id} not found"))),
            },
        }
    }

    async fn transition_offer(
        &self,
        scope: &TenantScope,
        id: OfferId,
        expected_from: OfferPhase,
        change: &OfferPhaseChange,
    ) -> StorageResult<Offer> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        match apply_phase_change(&mut conn, scope, id, expected_from, None, change).await? {
            Some(offer) => Ok(offer),
            None => Err(self.offer_miss(scope, id, expected_from).await),
        }
    }

    async fn append_offer_number_suffix(
        &self,
        scope: &TenantScope,
        id: OfferId,
        suffix: &str,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<String> {
        let row = sqlx::query(
            r#"
            UPDATE offers
               SET offer_number = offer_number || $1, updated_at = $2
             WHERE id = $3
               AND offer_number IS NOT NULL
               AND ($4::TEXT IS NULL OR company_id = $4)
            RETURNING offer_number
            "#,
        )
        .bind(suffix)
        .bind(updated_at)
        .bind(id.as_uuid())
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        match row {
            Some(row) => column(&row, "offer_number"),
            None => match self.get_offer(scope, id).await? {
                Some(_) => Err(StorageError::InvalidInput(format!(
                    "offer {id} has no number to suffix"
                ))),
                None => Err(StorageError::NotFound(format!("offer {id} not found"))),
            },
        }
    }

    async fn expire_sibling_offers(
        &self,
        scope: &TenantScope,
        project_id: ProjectId,
        winner: OfferId,
        at: DateTime<Utc>,
    ) -> StorageResult<Vec<OfferId>> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        expire_siblings(&mut conn, scope, project_id, winner, at).await
    }

    async fn list_pipeline_offers(
        &self,
        scope: &TenantScope,
        range: &DateRange,
    ) -> StorageResult<Vec<PipelineOfferRow>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, company_id, project_id, phase, value, probability, created_at
              FROM offers
             WHERE phase IN {PIPELINE_PHASES_SQL}
               AND ($1::TEXT IS NULL OR company_id = $1)
               AND ($2::TIMESTAMPTZ IS NULL OR created_at >= $2)
               AND ($3::TIMESTAMPTZ IS NULL OR created_at <= $3)
            "#
        ))
        .bind(scope.filter().map(CompanyId::as_str))
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| -> StorageResult<PipelineOfferRow> {
                Ok(PipelineOfferRow {
                    id: OfferId::from_uuid(column(row, "id")?),
                    company_id: CompanyId::new(column::<String>(row, "company_id")?),
                    project_id: column::<Option<Uuid>>(row, "project_id")?.map(ProjectId::from_uuid),
                    phase: column::<String>(row, "phase")?.parse()?,
                    value: column(row, "value")?,
                    probability: to_probability(column(row, "probability")?)?,
                    created_at: column(row, "created_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ProjectStore for PostgresPipelineStore {
    async fn insert_project(&self, project: &Project) -> StorageResult<()> {
        project
            .validate()
            .map_err(|e| StorageError::InvalidInput(e.to_string()))?;
        sqlx::query(&format!(
            "INSERT INTO projects ({PROJECT_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, \
              $19, $20)"
        ))
        .bind(project.id.as_uuid())
        .bind(project.company_id.as_str())
        .bind(&project.name)
        .bind(&project.project_number)
        .bind(project.phase.as_str())
        .bind(project.value)
        .bind(project.cost)
        .bind(project.budget)
        .bind(project.spent)
        .bind(project.has_detailed_budget)
        .bind(project.customer_id.map(|c| *c.as_uuid()))
        .bind(project.customer_name.as_deref())
        .bind(project.manager_id.as_ref().map(UserId::as_str))
        .bind(project.manager_name.as_deref())
        .bind(project.description.as_deref())
        .bind(project.location.as_deref())
        .bind(project.winning_offer_id.map(|o| *o.as_uuid()))
        .bind(project.won_at)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_project(
        &self,
        scope: &TenantScope,
        id: ProjectId,
    ) -> StorageResult<Option<Project>> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1 AND ($2::TEXT IS NULL OR company_id = $2)"
        ))
        .bind(id.as_uuid())
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.as_ref().map(row_to_project).transpose()
    }

    async fn update_project_economics(
        &self,
        scope: &TenantScope,
        id: ProjectId,
        economics: &ProjectEconomics,
    ) -> StorageResult<bool> {
        let (touch_customer, customer_id, customer_name) = match &economics.customer {
            CustomerUpdate::Unchanged => (false, None, None),
            CustomerUpdate::Known { id, name } => (true, Some(*id.as_uuid()), name.as_deref()),
            CustomerUpdate::Unknown => (true, None, None),
        };
        let result = sqlx::query(
            r#"
            UPDATE projects
               SET value = $1,
                   cost = $2,
                   budget = $3,
                   customer_id = CASE WHEN $4 THEN $5 ELSE customer_id END,
                   customer_name = CASE WHEN $4 THEN $6 ELSE customer_name END,
                   updated_at = $7
             WHERE id = $8
               AND phase = 'tilbud'
               AND ($9::TEXT IS NULL OR company_id = $9)
            "#,
        )
        .bind(economics.value)
        .bind(economics.cost)
        .bind(economics.budget)
        .bind(touch_customer)
        .bind(customer_id)
        .bind(customer_name)
        .bind(economics.updated_at)
        .bind(id.as_uuid())
        .bind(scope.filter().map(CompanyId::as_str))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return match self.get_project(scope, id).await? {
                Some(_) => Ok(false),
                None => Err(StorageError::NotFound(format!("project {id} not found"))),
            };
        }
        Ok(true)
    }

    async fn set_winning_offer(
        &self,
        scope: &TenantScope,
        id: ProjectId,
        winner: &WinningOffer,
    ) -> StorageResult<Project> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        match adopt_winner(&mut conn, scope, id, winner).await? {
            Some(project) => Ok(project),
            None => Err(self.winner_miss(scope, id).await),
        }
    }

    async fn change_project_phase(
        &self,
        scope: &TenantScope,
        id: ProjectId,
        expected_from: ProjectPhase,
        to: ProjectPhase,
        at: DateTime<Utc>,
    ) -> StorageResult<Project> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE projects
               SET phase = $1, updated_at = $2
             WHERE id = $3
               AND phase = $4
               AND ($5::TEXT IS NULL OR company_id = $5)
            RETURNING {PROJECT_COLUMNS}
            "#
        ))
        .bind(to.as_str())
        .bind(at)
        .bind(id.as_uuid())
        .bind(expected_from.as_str())
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        match row {
            Some(row) => row_to_project(&row),
            None => match self.get_project(scope, id).await? {
                Some(p) => Err(StorageError::InvalidTransition(format!(
                    "project {id} is {}, expected {expected_from}",
                    p.phase
                ))),
                None => Err(StorageError::NotFound(format!("project {id} not found"))),
            },
        }
    }

    async fn insert_budget_item(&self, item: &BudgetItem) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO budget_items (id, company_id, parent_kind, parent_id, name, expected_cost, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(item.company_id.as_str())
        .bind(item.parent.kind())
        .bind(item.parent.as_uuid())
        .bind(&item.name)
        .bind(item.expected_cost)
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn list_budget_items(
        &self,
        scope: &TenantScope,
        parent: BudgetParent,
    ) -> StorageResult<Vec<BudgetItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, company_id, parent_kind, parent_id, name, expected_cost, created_at
              FROM budget_items
             WHERE parent_kind = $1
               AND parent_id = $2
               AND ($3::TEXT IS NULL OR company_id = $3)
             ORDER BY created_at ASC
            "#,
        )
        .bind(parent.kind())
        .bind(parent.as_uuid())
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| -> StorageResult<BudgetItem> {
                let kind: String = column(row, "parent_kind")?;
                Ok(BudgetItem {
                    id: BudgetItemId::from_uuid(column(row, "id")?),
                    company_id: CompanyId::new(column::<String>(row, "company_id")?),
                    parent: BudgetParent::from_parts(&kind, column(row, "parent_id")?)?,
                    name: column(row, "name")?,
                    expected_cost: column(row, "expected_cost")?,
                    created_at: column(row, "created_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl WorkflowStore for PostgresPipelineStore {
    async fn commit_offer_win(
        &self,
        scope: &TenantScope,
        win: &OfferWin,
    ) -> StorageResult<WinReceipt> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let conn = tx.acquire().await.map_err(map_sqlx_error)?;
        self.set_lock_timeout(conn).await?;

        // Lock the project before any offer row so concurrent wins for the
        // same project queue here instead of deadlocking on sibling rows.
        if let Some(pw) = &win.project {
            let locked = sqlx::query(
                "SELECT id FROM projects WHERE id = $1 AND ($2::TEXT IS NULL OR company_id = $2) FOR UPDATE",
            )
            .bind(pw.project_id.as_uuid())
            .bind(scope.filter().map(CompanyId::as_str))
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
            if locked.is_none() {
                tx.rollback().await.map_err(map_sqlx_error)?;
                return Err(StorageError::NotFound(format!(
                    "project {} not found",
                    pw.project_id
                )));
            }
        }

        let expected_project = win.project.as_ref().map(|pw| pw.project_id);
        let Some(offer) = apply_phase_change(
            conn,
            scope,
            win.offer_id,
            OfferPhase::Sent,
            Some(expected_project),
            &win.change,
        )
        .await?
        else {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Err(self.win_miss(scope, win.offer_id, expected_project).await);
        };

        let mut project = None;
        let mut expired_siblings = Vec::new();
        if let Some(pw) = &win.project {
            match adopt_winner(conn, scope, pw.project_id, &pw.adoption).await? {
                Some(p) => project = Some(p),
                None => {
                    tx.rollback().await.map_err(map_sqlx_error)?;
                    return Err(self.winner_miss(scope, pw.project_id).await);
                }
            }
            expired_siblings = expire_siblings(
                conn,
                scope,
                pw.project_id,
                win.offer_id,
                win.change.updated_at,
            )
            .await?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(WinReceipt {
            offer,
            project,
            expired_siblings,
        })
    }
}

#[async_trait]
impl AggregateStore for PostgresPipelineStore {
    async fn refresh_pipeline_aggregate(&self) -> StorageResult<usize> {
        sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY dashboard_metrics_aggregation")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM dashboard_metrics_aggregation")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let n: i64 = column(&row, "n")?;
        usize::try_from(n).map_err(|_| StorageError::Serialization(format!("row count {n}")))
    }

    async fn materialized_pipeline_rows(
        &self,
        scope: &TenantScope,
    ) -> StorageResult<Vec<MaterializedPipelineRow>> {
        let rows = sqlx::query(
            r#"
            SELECT company_id, phase, project_count, offer_count, total_value, weighted_value
              FROM dashboard_metrics_aggregation
             WHERE ($1::TEXT IS NULL OR company_id = $1)
             ORDER BY company_id, phase
            "#,
        )
        .bind(scope.filter().map(CompanyId::as_str))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| -> StorageResult<MaterializedPipelineRow> {
                Ok(MaterializedPipelineRow {
                    company_id: CompanyId::new(column::<String>(row, "company_id")?),
                    phase: column::<String>(row, "phase")?.parse()?,
                    totals: PhaseTotals {
                        project_count: to_u64(column(row, "project_count")?, "project_count")?,
                        offer_count: to_u64(column(row, "offer_count")?, "offer_count")?,
                        total_value: column(row, "total_value")?,
                        weighted_value: column(row, "weighted_value")?,
                    },
                })
            })
            .collect()
    }
}

/// Map driver errors onto the storage taxonomy.
fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("23505") => return StorageError::Conflict(db_err.message().to_string()),
            // lock_not_available, deadlock_detected, serialization_failure
            Some("55P03") | Some("40P01") | Some("40001") => {
                return StorageError::Transient(db_err.message().to_string())
            }
            _ => {}
        }
    }
    if matches!(err, sqlx::Error::PoolTimedOut) {
        return StorageError::Transient(err.to_string());
    }
    StorageError::Backend(err.to_string())
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> StorageResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StorageError::Backend(e.to_string()))
}

fn to_u64(value: i64, field: &str) -> StorageResult<u64> {
    u64::try_from(value)
        .map_err(|_| StorageError::Serialization(format!("{field} is negative: {value}")))
}

fn to_i64(value: u64) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput(format!("sequence value {value} too large")))
}

fn to_probability(value: i16) -> StorageResult<u8> {
    u8::try_from(value)
        .ok()
        .filter(|p| *p <= 100)
        .ok_or_else(|| StorageError::Serialization(format!("probability out of range: {value}")))
}

fn row_to_offer(row: &PgRow) -> StorageResult<Offer> {
    let category: Option<String> = column(row, "loss_reason_category")?;
    Ok(Offer {
        id: OfferId::from_uuid(column(row, "id")?),
        company_id: CompanyId::new(column::<String>(row, "company_id")?),
        project_id: column::<Option<Uuid>>(row, "project_id")?.map(ProjectId::from_uuid),
        customer_id: column::<Option<Uuid>>(row, "customer_id")?.map(CustomerId::from_uuid),
        customer_name: column(row, "customer_name")?,
        title: column(row, "title")?,
        phase: column::<String>(row, "phase")?.parse()?,
        value: column(row, "value")?,
        cost: column(row, "cost")?,
        probability: to_probability(column(row, "probability")?)?,
        offer_number: column(row, "offer_number")?,
        external_reference: column(row, "external_reference")?,
        responsible_user_id: column::<Option<String>>(row, "responsible_user_id")?.map(UserId::new),
        responsible_user_name: column(row, "responsible_user_name")?,
        description: column(row, "description")?,
        location: column(row, "location")?,
        sent_at: column(row, "sent_at")?,
        expires_at: column(row, "expires_at")?,
        closed_at: column(row, "closed_at")?,
        loss_reason_category: category.map(|c| c.parse()).transpose()?,
        loss_reason: column(row, "loss_reason")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn row_to_project(row: &PgRow) -> StorageResult<Project> {
    Ok(Project {
        id: ProjectId::from_uuid(column(row, "id")?),
        company_id: CompanyId::new(column::<String>(row, "company_id")?),
        name: column(row, "name")?,
        project_number: column(row, "project_number")?,
        phase: column::<String>(row, "phase")?.parse()?,
        value: column(row, "value")?,
        cost: column(row, "cost")?,
        budget: column(row, "budget")?,
        spent: column(row, "spent")?,
        has_detailed_budget: column(row, "has_detailed_budget")?,
        customer_id: column::<Option<Uuid>>(row, "customer_id")?.map(CustomerId::from_uuid),
        customer_name: column(row, "customer_name")?,
        manager_id: column::<Option<String>>(row, "manager_id")?.map(UserId::new),
        manager_name: column(row, "manager_name")?,
        description: column(row, "description")?,
        location: column(row, "location")?,
        winning_offer_id: column::<Option<Uuid>>(row, "winning_offer_id")?.map(OfferId::from_uuid),
        won_at: column(row, "won_at")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

//! PostgreSQL backend tests. Skipped unless `PIPELINE_TEST_DATABASE_URL` is set.

#![cfg(feature = "postgres")]

use chrono::Utc;
use pipeline_store::postgres::PostgresPipelineStore;
use pipeline_store::{
    AggregateStore, OfferStore, OfferWin, ProjectStore, ProjectWin, SequenceStore, StorageError,
    WorkflowStore,
};
use pipeline_types::{
    aggregate_by_company, merge_phases, CompanyId, DateRange, NewOffer, NewProject, OfferId,
    OfferPhase, OfferPhaseChange, ProjectId, TenantScope, WinningOffer,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

async fn store() -> Option<Arc<PostgresPipelineStore>> {
    let url = std::env::var("PIPELINE_TEST_DATABASE_URL").ok()?;
    let store = PostgresPipelineStore::connect_with_options(&url, 20, 5, 2_000)
        .await
        .expect("connect test database");
    Some(Arc::new(store))
}

fn fresh_company() -> CompanyId {
    CompanyId::new(format!("test-{}", Uuid::new_v4().simple()))
}

fn adoption(offer_id: OfferId, value: Decimal) -> WinningOffer {
    WinningOffer {
        offer_id,
        value,
        cost: Decimal::ZERO,
        customer_id: None,
        customer_name: None,
        manager_id: None,
        manager_name: None,
        description: None,
        location: None,
        won_at: Utc::now(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocation_is_gap_free() {
    let Some(store) = store().await else { return };
    let company = fresh_company();

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let store = store.clone();
            let company = company.clone();
            tokio::spawn(async move { store.next_sequence_value(&company, 2025).await })
        })
        .collect();

    let mut seen = BTreeSet::new();
    for handle in futures::future::join_all(handles).await {
        let value = handle.unwrap().unwrap();
        assert!(seen.insert(value), "duplicate sequence value {value}");
    }
    assert_eq!(seen, (1..=40).collect::<BTreeSet<u64>>());
    assert_eq!(store.current_sequence_value(&company, 2025).await.unwrap(), 40);
}

#[tokio::test]
async fn floor_is_monotonic() {
    let Some(store) = store().await else { return };
    let company = fresh_company();
    assert_eq!(store.raise_sequence_floor(&company, 2024, 17).await.unwrap(), 17);
    assert_eq!(store.raise_sequence_floor(&company, 2024, 3).await.unwrap(), 17);
    assert_eq!(store.next_sequence_value(&company, 2024).await.unwrap(), 18);
}

#[tokio::test]
async fn exhausted_sequence_is_rejected() {
    let Some(store) = store().await else { return };
    let company = fresh_company();
    assert!(matches!(
        store.raise_sequence_floor(&company, 2024, u64::MAX).await,
        Err(StorageError::InvalidInput(_))
    ));
    let ceiling = i64::MAX as u64;
    assert_eq!(store.raise_sequence_floor(&company, 2024, ceiling).await.unwrap(), ceiling);
    assert!(matches!(
        store.next_sequence_value(&company, 2024).await,
        Err(StorageError::InvalidInput(_))
    ));
    assert_eq!(store.current_sequence_value(&company, 2024).await.unwrap(), ceiling);
}

#[tokio::test]
async fn racing_wins_leave_one_winner() {
    let Some(store) = store().await else { return };
    let company = fresh_company();
    let scope = TenantScope::Company(company.clone());

    let project = NewProject::new(company.clone(), "Race").into_project(
        ProjectId::generate(),
        format!("{}-P", company),
        Utc::now(),
    );
    store.insert_project(&project).await.unwrap();

    let mut ids = Vec::new();
    for (i, value) in [dec!(500), dec!(700)].into_iter().enumerate() {
        let offer = NewOffer::new(company.clone(), "Bid")
            .in_phase(OfferPhase::Sent)
            .for_project(project.id)
            .priced(value, Decimal::ZERO, 50)
            .into_offer(OfferId::generate(), Some(format!("T-2025-00{i}")), Utc::now());
        store.insert_offer(&offer).await.unwrap();
        ids.push((offer.id, value));
    }

    let attempts: Vec<_> = ids
        .iter()
        .map(|(id, value)| {
            let store = store.clone();
            let scope = scope.clone();
            let mut change = OfferPhaseChange::to(OfferPhase::Order, Utc::now());
            change.probability = Some(100);
            let win = OfferWin {
                offer_id: *id,
                change,
                project: Some(ProjectWin {
                    project_id: project.id,
                    adoption: adoption(*id, *value),
                }),
            };
            tokio::spawn(async move { store.commit_offer_win(&scope, &win).await })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(StorageError::Conflict(_)) | Err(StorageError::InvalidTransition(_))
    )));

    let offers = store.list_project_offers(&scope, project.id).await.unwrap();
    let in_order = offers.iter().filter(|o| o.phase == OfferPhase::Order).count();
    assert_eq!(in_order, 1);
}

#[tokio::test]
async fn win_for_stale_project_link_is_rejected() {
    let Some(store) = store().await else { return };
    let company = fresh_company();
    let scope = TenantScope::Company(company.clone());

    let mut projects = Vec::new();
    for name in ["Old", "New"] {
        let project = NewProject::new(company.clone(), name).into_project(
            ProjectId::generate(),
            format!("{company}-{name}"),
            Utc::now(),
        );
        store.insert_project(&project).await.unwrap();
        projects.push(project.id);
    }
    let (old, new) = (projects[0], projects[1]);

    let offer = NewOffer::new(company.clone(), "Bid")
        .in_phase(OfferPhase::Sent)
        .for_project(old)
        .priced(dec!(300), Decimal::ZERO, 50)
        .into_offer(OfferId::generate(), Some("R-2025-001".into()), Utc::now());
    store.insert_offer(&offer).await.unwrap();
    store
        .set_offer_project(&scope, offer.id, Some(new), Utc::now())
        .await
        .unwrap();

    let win = OfferWin {
        offer_id: offer.id,
        change: OfferPhaseChange::to(OfferPhase::Order, Utc::now()),
        project: Some(ProjectWin {
            project_id: old,
            adoption: adoption(offer.id, dec!(300)),
        }),
    };
    assert!(matches!(
        store.commit_offer_win(&scope, &win).await,
        Err(StorageError::Conflict(_))
    ));
    let old_project = store.get_project(&scope, old).await.unwrap().unwrap();
    assert_eq!(old_project.winning_offer_id, None);
    let offer = store.get_offer(&scope, offer.id).await.unwrap().unwrap();
    assert_eq!(offer.phase, OfferPhase::Sent);
}

#[tokio::test]
async fn materialized_view_matches_raw_rows() {
    let Some(store) = store().await else { return };
    let company = fresh_company();
    let scope = TenantScope::Company(company.clone());

    let project = NewProject::new(company.clone(), "Agg").into_project(
        ProjectId::generate(),
        format!("{}-P", company),
        Utc::now(),
    );
    store.insert_project(&project).await.unwrap();
    for (i, (value, p, linked)) in [(dec!(100), 10, true), (dec!(300), 30, true), (dec!(80.5), 55, false)]
        .into_iter()
        .enumerate()
    {
        let mut new = NewOffer::new(company.clone(), "Agg offer")
            .in_phase(OfferPhase::Sent)
            .priced(value, Decimal::ZERO, p);
        if linked {
            new = new.for_project(project.id);
        }
        let offer = new.into_offer(OfferId::generate(), Some(format!("A-2025-00{i}")), Utc::now());
        store.insert_offer(&offer).await.unwrap();
    }

    store.refresh_pipeline_aggregate().await.unwrap();
    let materialized = merge_phases(&store.materialized_pipeline_rows(&scope).await.unwrap());
    let raw_rows = store
        .list_pipeline_offers(&scope, &DateRange::default())
        .await
        .unwrap();
    let raw = merge_phases(&aggregate_by_company(&raw_rows));
    assert_eq!(materialized, raw);

    let sent = raw.iter().find(|s| s.phase == OfferPhase::Sent).unwrap();
    assert_eq!(sent.totals.total_value, dec!(380.5));
    assert_eq!(sent.totals.project_count, 2);
    assert_eq!(sent.totals.offer_count, 3);
}

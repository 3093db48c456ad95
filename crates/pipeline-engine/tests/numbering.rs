use futures::future::join_all;
use pipeline_engine::{EngineError, EngineSettings, PipelineEngine, RetryPolicy};
use pipeline_store::InMemoryPipelineStore;
use pipeline_types::{CompanyDirectory, CompanyId, NewOffer, NewProject, OfferPhase, TenantScope};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

fn engine() -> Arc<PipelineEngine> {
    let directory = CompanyDirectory::new()
        .with_company("acme", "ACME")
        .with_company("beta", "BETA");
    let mut settings = EngineSettings::new(directory);
    settings.retry = RetryPolicy::none();
    Arc::new(PipelineEngine::new(
        Arc::new(InMemoryPipelineStore::new()),
        settings,
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_numbers_are_distinct_and_dense() {
    let engine = engine();
    let acme = CompanyId::new("acme");
    let handles = (0..3).map(|_| {
        let engine = engine.clone();
        let acme = acme.clone();
        tokio::spawn(async move {
            engine
                .numbering()
                .generate_number_for_year(&acme, 2025)
                .await
        })
    });
    let mut numbers: Vec<String> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    numbers.sort();
    assert_eq!(numbers, ["ACME-2025-001", "ACME-2025-002", "ACME-2025-003"]);
}

#[tokio::test]
async fn out_of_range_floor_is_rejected() {
    let engine = engine();
    let acme = CompanyId::new("acme");
    assert!(matches!(
        engine.sequences().set_floor(&acme, 2025, u64::MAX).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert_eq!(engine.sequences().next(&acme, 2025).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_allocation_has_no_gaps() {
    const N: u64 = 64;
    let engine = engine();
    let acme = CompanyId::new("acme");
    let handles = (0..N).map(|_| {
        let engine = engine.clone();
        let acme = acme.clone();
        tokio::spawn(async move { engine.sequences().next(&acme, 2025).await })
    });
    let values: BTreeSet<u64> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    assert_eq!(values, (1..=N).collect::<BTreeSet<_>>());
    assert_eq!(engine.sequences().current(&acme, 2025).await.unwrap(), N);
}

#[tokio::test]
async fn offers_and_projects_share_one_sequence() {
    let engine = engine();
    let scope = TenantScope::company("acme");
    let acme = CompanyId::new("acme");
    let project = engine
        .projects()
        .create_project(&scope, NewProject::new(acme.clone(), "Hall"))
        .await
        .unwrap();
    let offer = engine
        .offers()
        .create_offer(&scope, NewOffer::new(acme.clone(), "Roof").in_phase(OfferPhase::Sent))
        .await
        .unwrap();

    assert!(project.project_number.ends_with("-001"));
    assert!(offer.offer_number.unwrap().ends_with("-002"));
}

#[tokio::test]
async fn companies_count_independently() {
    let engine = engine();
    let acme = CompanyId::new("acme");
    let beta = CompanyId::new("beta");
    engine.sequences().next(&acme, 2025).await.unwrap();
    engine.sequences().next(&acme, 2025).await.unwrap();
    assert_eq!(
        engine.numbering().generate_number_for_year(&beta, 2025).await.unwrap(),
        "BETA-2025-001"
    );

    let listed = engine.sequences().list(&TenantScope::company("acme")).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].last_value, 2);
}

proptest! {
    #[test]
    fn floor_never_lowers_the_counter(floors in proptest::collection::vec(0u64..5_000, 1..20)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let engine = engine();
            let acme = CompanyId::new("acme");
            let mut expected = 0;
            for floor in floors {
                let after = engine.sequences().set_floor(&acme, 2025, floor).await.unwrap();
                expected = expected.max(floor);
                assert_eq!(after, expected);
            }
            let next = engine.sequences().next(&acme, 2025).await.unwrap();
            assert_eq!(next, expected + 1);
        });
    }
}

use pipeline_engine::{EngineError, EngineSettings, PipelineEngine, RetryPolicy, TransitionMetadata};
use pipeline_store::InMemoryPipelineStore;
use pipeline_types::{
    BudgetParent, Caller, CompanyDirectory, CompanyId, CustomerId, LossReasonCategory, NewOffer,
    NewProject, Offer, OfferPhase, Project, ProjectHealth, ProjectPhase, TenantScope, UserId,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn engine() -> Arc<PipelineEngine> {
    let directory = CompanyDirectory::new()
        .with_company("acme", "ACME")
        .with_company("beta", "BETA")
        .with_company("group", "GRP")
        .with_group("group");
    let mut settings = EngineSettings::new(directory);
    settings.retry = RetryPolicy::none();
    Arc::new(PipelineEngine::new(
        Arc::new(InMemoryPipelineStore::new()),
        settings,
    ))
}

fn acme() -> TenantScope {
    TenantScope::company("acme")
}

async fn project(engine: &PipelineEngine, name: &str) -> Project {
    engine
        .projects()
        .create_project(&acme(), NewProject::new(CompanyId::new("acme"), name))
        .await
        .unwrap()
}

async fn sent_offer(engine: &PipelineEngine, project: &Project, value: Decimal) -> Offer {
    engine
        .offers()
        .create_offer(
            &acme(),
            NewOffer::new(CompanyId::new("acme"), "Offer")
                .in_phase(OfferPhase::Sent)
                .for_project(project.id)
                .priced(value, value / dec!(2), 50),
        )
        .await
        .unwrap()
}

async fn win(engine: &PipelineEngine, offer: &Offer) -> Result<pipeline_engine::TransitionOutcome, EngineError> {
    engine
        .offers()
        .transition(&acme(), offer.id, OfferPhase::Order, TransitionMetadata::default())
        .await
}

#[tokio::test]
async fn winning_offer_promotes_project_and_expires_siblings() {
    let engine = engine();
    let p = project(&engine, "Warehouse").await;
    let a = sent_offer(&engine, &p, dec!(500)).await;
    let b = sent_offer(&engine, &p, dec!(700)).await;

    let out = win(&engine, &b).await.unwrap();
    assert_eq!(out.offer.phase, OfferPhase::Order);
    assert_eq!(out.expired_siblings, vec![a.id]);

    let project = out.project.unwrap();
    assert_eq!(project.phase, ProjectPhase::Active);
    assert_eq!(project.value, dec!(700));
    assert_eq!(project.winning_offer_id, Some(b.id));

    let a = engine.offers().get_offer(&acme(), a.id).await.unwrap();
    assert_eq!(a.phase, OfferPhase::Expired);
    assert!(a.closed_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_wins_leave_exactly_one_winner() {
    let engine = engine();
    let p = project(&engine, "Bridge").await;
    let a = sent_offer(&engine, &p, dec!(100)).await;
    let b = sent_offer(&engine, &p, dec!(200)).await;

    let (ra, rb) = {
        let (e1, e2) = (engine.clone(), engine.clone());
        let (a, b) = (a.clone(), b.clone());
        tokio::join!(
            tokio::spawn(async move { win(&e1, &a).await }),
            tokio::spawn(async move { win(&e2, &b).await }),
        )
    };
    let results = [ra.unwrap(), rb.unwrap()];
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(
            err,
            EngineError::Conflict(_) | EngineError::InvalidTransition(_)
        ));
    }

    let project = engine.projects().get_project(&acme(), p.id).await.unwrap();
    assert_eq!(project.winning_offer_id, Some(winners[0].offer.id));
    let offers = engine.offers().list_project_offers(&acme(), p.id).await.unwrap();
    assert_eq!(offers.iter().filter(|o| o.phase == OfferPhase::Order).count(), 1);
    assert_eq!(offers.iter().filter(|o| o.phase == OfferPhase::Expired).count(), 1);
}

#[tokio::test]
async fn sibling_expiry_is_idempotent() {
    let engine = engine();
    let p = project(&engine, "Depot").await;
    let a = sent_offer(&engine, &p, dec!(100)).await;
    let b = sent_offer(&engine, &p, dec!(200)).await;
    win(&engine, &b).await.unwrap();

    let again = engine
        .offers()
        .expire_siblings(&acme(), p.id, b.id)
        .await
        .unwrap();
    assert!(again.is_empty());
    let a = engine.offers().get_offer(&acme(), a.id).await.unwrap();
    assert_eq!(a.phase, OfferPhase::Expired);
}

#[tokio::test]
async fn second_win_on_won_project_conflicts() {
    let engine = engine();
    let p = project(&engine, "Silo").await;
    let a = sent_offer(&engine, &p, dec!(100)).await;
    win(&engine, &a).await.unwrap();

    // A fresh offer linked after the win cannot take the project over.
    let late = sent_offer(&engine, &p, dec!(900)).await;
    assert!(matches!(win(&engine, &late).await, Err(EngineError::Conflict(_))));
    let late = engine.offers().get_offer(&acme(), late.id).await.unwrap();
    assert_eq!(late.phase, OfferPhase::Sent);
}

#[tokio::test]
async fn best_offer_drives_bidding_economics() {
    let engine = engine();
    let p = project(&engine, "Tower").await;
    sent_offer(&engine, &p, dec!(300)).await;
    let high = sent_offer(&engine, &p, dec!(800)).await;

    let project = engine.projects().get_project(&acme(), p.id).await.unwrap();
    assert_eq!(project.value, dec!(800));
    assert_eq!(project.budget, dec!(800));
    assert_eq!(project.cost, dec!(400));

    engine
        .offers()
        .transition(
            &acme(),
            high.id,
            OfferPhase::Lost,
            TransitionMetadata::lost(LossReasonCategory::Competitor, "went elsewhere"),
        )
        .await
        .unwrap();
    let project = engine.projects().get_project(&acme(), p.id).await.unwrap();
    assert_eq!(project.value, dec!(300));
}

#[tokio::test]
async fn shared_customer_is_inferred_and_cleared_on_disagreement() {
    let engine = engine();
    let p = project(&engine, "Mall").await;
    let customer = CustomerId::generate();
    for value in [dec!(10), dec!(20)] {
        engine
            .offers()
            .create_offer(
                &acme(),
                NewOffer::new(CompanyId::new("acme"), "Offer")
                    .for_project(p.id)
                    .for_customer(customer, "Northwind")
                    .priced(value, dec!(0), 10),
            )
            .await
            .unwrap();
    }
    let project = engine.projects().get_project(&acme(), p.id).await.unwrap();
    assert_eq!(project.customer_id, Some(customer));
    assert_eq!(project.customer_name.as_deref(), Some("Northwind"));

    engine
        .offers()
        .create_offer(
            &acme(),
            NewOffer::new(CompanyId::new("acme"), "Offer")
                .for_project(p.id)
                .for_customer(CustomerId::generate(), "Contoso"),
        )
        .await
        .unwrap();
    let project = engine.projects().get_project(&acme(), p.id).await.unwrap();
    assert_eq!(project.customer_id, None);
}

#[tokio::test]
async fn won_project_keeps_its_own_description() {
    let engine = engine();
    let mut new = NewProject::new(CompanyId::new("acme"), "Harbour");
    new.description = Some("Project description".into());
    let p = engine.projects().create_project(&acme(), new).await.unwrap();

    let mut offer = NewOffer::new(CompanyId::new("acme"), "Offer")
        .in_phase(OfferPhase::Sent)
        .for_project(p.id)
        .priced(dec!(1000), dec!(600), 70);
    offer.description = Some("Offer description".into());
    offer.location = Some("Bergen".into());
    offer.responsible_user_id = Some(UserId::new("u-17"));
    offer.responsible_user_name = Some("Kari".into());
    let offer = engine.offers().create_offer(&acme(), offer).await.unwrap();

    let project = win(&engine, &offer).await.unwrap().project.unwrap();
    assert_eq!(project.description.as_deref(), Some("Project description"));
    assert_eq!(project.location.as_deref(), Some("Bergen"));
    assert_eq!(project.manager_id, Some(UserId::new("u-17")));
    assert_eq!(project.margin_percent(), dec!(40));
}

#[tokio::test]
async fn records_of_other_tenants_are_not_found() {
    let engine = engine();
    let p = project(&engine, "Plant").await;
    let offer = sent_offer(&engine, &p, dec!(100)).await;
    let beta = Caller::member("beta").record_scope();

    assert!(matches!(
        engine.offers().get_offer(&beta, offer.id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine
            .offers()
            .transition(&beta, offer.id, OfferPhase::Order, TransitionMetadata::default())
            .await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.projects().get_project(&beta, p.id).await,
        Err(EngineError::NotFound(_))
    ));

    let admin = Caller::super_admin("beta").record_scope();
    assert!(engine.offers().get_offer(&admin, offer.id).await.is_ok());

    // Group membership widens attachments only.
    let group = Caller::member("group");
    assert!(engine.offers().get_offer(&group.record_scope(), offer.id).await.is_err());
    assert_eq!(
        group.attachment_scope(engine.numbering().directory()),
        TenantScope::Unrestricted
    );
}

#[tokio::test]
async fn health_follows_budget_usage() {
    let engine = engine();
    let mut new = NewProject::new(CompanyId::new("acme"), "Road");
    new.budget = dec!(1000);
    new.spent = dec!(1150);
    let p = engine.projects().create_project(&acme(), new).await.unwrap();
    let report = engine.projects().health(&acme(), p.id).await.unwrap();
    assert_eq!(report.health, ProjectHealth::AtRisk);
    assert_eq!(report.used_percent, dec!(115));

    let mut new = NewProject::new(CompanyId::new("acme"), "Rail");
    new.budget = dec!(1000);
    new.spent = dec!(10);
    new.has_detailed_budget = true;
    let p = engine.projects().create_project(&acme(), new).await.unwrap();
    for cost in [dec!(600), dec!(700)] {
        engine
            .projects()
            .add_budget_item(&acme(), BudgetParent::Project(p.id), "Line", cost)
            .await
            .unwrap();
    }
    let report = engine.projects().health(&acme(), p.id).await.unwrap();
    assert_eq!(report.spent, dec!(1300));
    assert_eq!(report.health, ProjectHealth::OverBudget);
}

#[tokio::test]
async fn bidding_project_cannot_be_activated_manually() {
    let engine = engine();
    let p = project(&engine, "Pier").await;
    assert!(matches!(
        engine.projects().change_phase(&acme(), p.id, ProjectPhase::Active).await,
        Err(EngineError::InvalidTransition(_))
    ));
    let cancelled = engine
        .projects()
        .change_phase(&acme(), p.id, ProjectPhase::Cancelled)
        .await
        .unwrap();
    assert_eq!(cancelled.phase, ProjectPhase::Cancelled);
}

#[tokio::test]
async fn set_winning_offer_rejects_foreign_offer() {
    let engine = engine();
    let p1 = project(&engine, "One").await;
    let p2 = project(&engine, "Two").await;
    let offer = sent_offer(&engine, &p2, dec!(100)).await;
    assert!(matches!(
        engine.projects().set_winning_offer(&acme(), p1.id, offer.id).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn set_winning_offer_requires_an_order() {
    let engine = engine();
    let p = project(&engine, "Quay").await;
    let a = sent_offer(&engine, &p, dec!(100)).await;
    let b = sent_offer(&engine, &p, dec!(200)).await;
    engine
        .offers()
        .transition(
            &acme(),
            a.id,
            OfferPhase::Lost,
            TransitionMetadata::lost(LossReasonCategory::Price, "too expensive"),
        )
        .await
        .unwrap();

    for offer in [&a, &b] {
        assert!(matches!(
            engine.projects().set_winning_offer(&acme(), p.id, offer.id).await,
            Err(EngineError::InvalidTransition(_))
        ));
    }
    let untouched = engine.projects().get_project(&acme(), p.id).await.unwrap();
    assert_eq!(untouched.phase, ProjectPhase::Tilbud);
    assert_eq!(untouched.winning_offer_id, None);

    // The real winner still goes through.
    let out = win(&engine, &b).await.unwrap();
    assert_eq!(out.project.unwrap().winning_offer_id, Some(b.id));
}

#[tokio::test]
async fn set_winning_offer_adopts_an_order_linked_later() {
    let engine = engine();
    let p = project(&engine, "Pier").await;
    let standalone = engine
        .offers()
        .create_offer(
            &acme(),
            NewOffer::new(CompanyId::new("acme"), "Offer")
                .in_phase(OfferPhase::Sent)
                .priced(dec!(450), dec!(200), 50),
        )
        .await
        .unwrap();
    win(&engine, &standalone).await.unwrap();
    engine
        .offers()
        .link_to_project(&acme(), standalone.id, Some(p.id))
        .await
        .unwrap();

    let won = engine
        .projects()
        .set_winning_offer(&acme(), p.id, standalone.id)
        .await
        .unwrap();
    assert_eq!(won.phase, ProjectPhase::Active);
    assert_eq!(won.winning_offer_id, Some(standalone.id));
    assert_eq!(won.value, dec!(450));
}

//! Integration tests for the reconciling poller.
//!
//! Validates:
//! - rows never signalled through the broker are still delivered
//! - the due scan uses the same early tolerance as the claim
//! - each tick honours its batch bound and concurrency cap
//! - failed rows are not retried; stale claims are failed
//! - a claim still being delivered is never expired
//! - a store outage aborts the tick with an error

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use interaction_relay::config::{
    DeliveryConfig, GlobalConfig, PollerConfig, STALE_CLAIM_MARGIN_SECONDS,
};
use interaction_relay::models::interaction::{ClaimSource, InteractionStatus};
use interaction_relay::orchestrator::dispatcher::{DispatchOutcome, Dispatcher};
use interaction_relay::orchestrator::reconciler::{spawn_reconciler, Reconciler, TickSummary};
use interaction_relay::persistence::interaction_repo::InteractionRepo;
use interaction_relay::publisher::Publisher;
use interaction_relay::AppError;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{
    dispatcher, interaction, memory_broker, memory_db, reconciler, seed_lead, seed_organization,
    store_interaction, wait_until, RecordingTarget, DEFAULT_URL,
};

fn past() -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::seconds(2)
}

async fn seed_due(db: &Arc<interaction_relay::persistence::db::Database>, count: usize) {
    seed_organization(db, None).await;
    for i in 0..count {
        let lead = format!("lead-{i}");
        seed_lead(db, &lead, "new").await;
        store_interaction(db, &lead, past()).await;
    }
}

#[tokio::test]
async fn no_due_rows_is_a_no_op() {
    let db = memory_db().await;
    seed_organization(&db, None).await;
    seed_lead(&db, "lead-1", "new").await;
    store_interaction(&db, "lead-1", Utc::now() + chrono::Duration::hours(1)).await;
    let target = RecordingTarget::new();

    let summary = reconciler(&db, target.clone(), 50, 4)
        .tick(ClaimSource::Poller)
        .await
        .expect("tick");

    assert_eq!(summary, TickSummary::default());
    assert_eq!(target.call_count(), 0);
}

#[tokio::test]
async fn delivers_rows_whose_signal_never_reached_the_broker() {
    let db = memory_db().await;
    seed_organization(&db, None).await;
    seed_lead(&db, "lead-1", "new").await;
    let (broker, topology) = memory_broker().await;
    broker.set_offline(true).await;
    let publisher = Publisher::new(Arc::new(broker.clone()), topology);

    let item = InteractionRepo::new(Arc::clone(&db))
        .create(&interaction("lead-1", past()))
        .await
        .expect("create");
    assert!(publisher.schedule(&item).await.is_err(), "broker is down");

    let target = RecordingTarget::new();
    let summary = reconciler(&db, target.clone(), 50, 4)
        .tick(ClaimSource::Poller)
        .await
        .expect("tick");

    assert_eq!(summary.delivered, 1);
    assert_eq!(target.calls()[0].context.interaction.id, item.id);
}

#[tokio::test]
async fn tick_picks_up_rows_within_the_early_tolerance() {
    let db = memory_db().await;
    seed_organization(&db, None).await;
    seed_lead(&db, "lead-1", "new").await;
    seed_lead(&db, "lead-2", "new").await;
    let soon =
        store_interaction(&db, "lead-1", Utc::now() + chrono::Duration::milliseconds(500)).await;
    let later =
        store_interaction(&db, "lead-2", Utc::now() + chrono::Duration::minutes(5)).await;
    let target = RecordingTarget::new();
    let tolerant = Dispatcher::new(
        Arc::clone(&db),
        target.clone(),
        &DeliveryConfig {
            webhook_url: Some(DEFAULT_URL.into()),
            early_tolerance_ms: 2_000,
            ..DeliveryConfig::default()
        },
    );

    let reconciler = Reconciler::new(
        tolerant,
        InteractionRepo::new(Arc::clone(&db)),
        &PollerConfig::default(),
    );
    let summary = reconciler
        .tick(ClaimSource::Poller)
        .await
        .expect("tick");

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.delivered, 1);
    assert_eq!(target.calls()[0].context.interaction.id, soon.id);
    let row = InteractionRepo::new(Arc::clone(&db))
        .get_by_id(&later.id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(row.status, InteractionStatus::Pending);
}

#[tokio::test]
async fn tick_is_bounded_by_batch_size() {
    let db = memory_db().await;
    seed_due(&db, 7).await;
    let reconciler = reconciler(&db, RecordingTarget::new(), 3, 2);

    let first = reconciler.tick(ClaimSource::Poller).await.expect("tick");
    assert_eq!(first.processed, 3);
    assert_eq!(first.delivered, 3);

    let counts = InteractionRepo::new(Arc::clone(&db))
        .count_by_status()
        .await
        .expect("counts");
    assert_eq!(counts.pending, 4);

    reconciler.tick(ClaimSource::Poller).await.expect("tick");
    let last = reconciler.tick(ClaimSource::Poller).await.expect("tick");
    assert_eq!(last.processed, 1);
}

#[tokio::test]
async fn concurrency_is_capped() {
    let db = memory_db().await;
    seed_due(&db, 10).await;
    let target = RecordingTarget::slow(Duration::from_millis(50));

    let summary = reconciler(&db, target.clone(), 50, 3)
        .tick(ClaimSource::Poller)
        .await
        .expect("tick");

    assert_eq!(summary.delivered, 10);
    assert!(target.peak_in_flight() <= 3, "peak {}", target.peak_in_flight());
    assert!(target.peak_in_flight() >= 2, "deliveries overlapped");
}

#[tokio::test]
async fn failed_rows_are_not_retried() {
    let db = memory_db().await;
    seed_due(&db, 2).await;
    let target = RecordingTarget::failing("503 from ai service");
    let reconciler = reconciler(&db, target.clone(), 50, 2);

    let first = reconciler.tick(ClaimSource::Poller).await.expect("tick");
    assert_eq!(first.failed, 2);

    let second = reconciler.tick(ClaimSource::Poller).await.expect("tick");
    assert_eq!(second.processed, 0);
    assert_eq!(target.call_count(), 2);
}

#[tokio::test]
async fn stale_claims_are_failed() {
    let db = memory_db().await;
    seed_organization(&db, None).await;
    seed_lead(&db, "lead-1", "new").await;
    let item = store_interaction(&db, "lead-1", past()).await;
    let repo = InteractionRepo::new(Arc::clone(&db));

    // A claimer that died after winning the claim.
    assert!(repo
        .claim(&item.id, Utc::now(), ClaimSource::Broker)
        .await
        .expect("claim"));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let target = RecordingTarget::new();
    let reconciler = Reconciler::new(
        dispatcher(&db, target.clone()),
        repo.clone(),
        &PollerConfig {
            stale_claim_seconds: 0,
            ..PollerConfig::default()
        },
    );
    let summary = reconciler.tick(ClaimSource::Poller).await.expect("tick");

    assert_eq!(summary.expired_claims, 1);
    assert_eq!(summary.processed, 0);
    assert_eq!(target.call_count(), 0, "a stale claim is never redelivered");
    let row = repo.get_by_id(&item.id).await.expect("query").expect("row");
    assert_eq!(row.status, InteractionStatus::Failed);
    assert_eq!(row.last_error.as_deref(), Some("claim expired before completion"));
}

#[tokio::test]
async fn fresh_claims_survive_the_sweep() {
    let db = memory_db().await;
    seed_organization(&db, None).await;
    seed_lead(&db, "lead-1", "new").await;
    let item = store_interaction(&db, "lead-1", past()).await;
    let repo = InteractionRepo::new(Arc::clone(&db));
    repo.claim(&item.id, Utc::now(), ClaimSource::Broker)
        .await
        .expect("claim");

    let summary = reconciler(&db, RecordingTarget::new(), 50, 4)
        .tick(ClaimSource::Poller)
        .await
        .expect("tick");

    assert_eq!(summary.expired_claims, 0);
    let row = repo.get_by_id(&item.id).await.expect("query").expect("row");
    assert_eq!(row.status, InteractionStatus::Claimed);
}

#[tokio::test]
async fn in_flight_delivery_is_not_expired_by_a_concurrent_tick() {
    let db = memory_db().await;
    seed_organization(&db, None).await;
    seed_lead(&db, "lead-1", "new").await;
    let item = store_interaction(&db, "lead-1", past()).await;
    let target = RecordingTarget::slow(Duration::from_millis(300));

    // Tightest stale-claim age the configuration accepts.
    let config = GlobalConfig::from_toml_str(&format!(
        "[poller]\nstale_claim_seconds = {}\n[delivery]\ntimeout_seconds = 1\n",
        1 + STALE_CLAIM_MARGIN_SECONDS
    ))
    .expect("valid config");
    let reconciler = Reconciler::new(
        dispatcher(&db, target.clone()),
        InteractionRepo::new(Arc::clone(&db)),
        &config.poller,
    );

    let broker_path = dispatcher(&db, target.clone());
    let id = item.id.clone();
    let delivery =
        tokio::spawn(async move { broker_path.claim_and_deliver(&id, ClaimSource::Broker).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let summary = reconciler.tick(ClaimSource::Poller).await.expect("tick");
    assert_eq!(summary.expired_claims, 0);
    assert_eq!(summary.processed, 0);

    let outcome = delivery.await.expect("join").expect("dispatch");
    assert_eq!(outcome, DispatchOutcome::Delivered);
    assert_eq!(target.call_count(), 1);
    let row = InteractionRepo::new(Arc::clone(&db))
        .get_by_id(&item.id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(row.status, InteractionStatus::Delivered);
    assert_eq!(row.last_error, None);
}

#[tokio::test]
async fn store_outage_fails_the_tick() {
    let db = memory_db().await;
    seed_due(&db, 1).await;
    let reconciler = reconciler(&db, RecordingTarget::new(), 50, 4);
    db.close().await;

    let result = reconciler.tick(ClaimSource::Poller).await;

    let Err(err) = result else {
        panic!("tick must fail while the store is closed");
    };
    assert!(matches!(err, AppError::Db(_)));
    assert!(err.is_infrastructure());
}

#[tokio::test]
async fn background_poller_delivers_and_stops_on_cancel() {
    let db = memory_db().await;
    seed_due(&db, 3).await;
    let target = RecordingTarget::new();
    let reconciler = Arc::new(reconciler(&db, target.clone(), 50, 4));
    let cancel = CancellationToken::new();

    let handle = spawn_reconciler(reconciler, Duration::from_millis(50), cancel.clone());

    let probe = Arc::clone(&target);
    assert!(
        wait_until(Duration::from_secs(5), || {
            let probe = Arc::clone(&probe);
            async move { probe.call_count() == 3 }
        })
        .await
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("poller stops")
        .expect("join");
    assert_eq!(target.call_count(), 3);
}

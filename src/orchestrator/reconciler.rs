//! Reconciling poller: the pull path.
//!
//! Scans the Durable Store for due `pending` rows and runs
//! claim-then-deliver on each, independent of whether the broker ever
//! delivered the matching message. Also fails claims abandoned by a
//! crashed worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatcher::{DispatchOutcome, Dispatcher};
use crate::config::PollerConfig;
use crate::models::interaction::ClaimSource;
use crate::persistence::interaction_repo::InteractionRepo;
use crate::Result;

/// Counts for one tick.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TickSummary {
    /// Due rows a claim was attempted on.
    pub processed: u64,
    /// Rows delivered.
    pub delivered: u64,
    /// Rows failed.
    pub failed: u64,
    /// Claims lost to another path.
    pub skipped: u64,
    /// Stale claims moved to `failed` before the scan.
    pub expired_claims: u64,
}

impl TickSummary {
    fn record(&mut self, outcome: &DispatchOutcome) {
        self.processed += 1;
        match outcome {
            DispatchOutcome::Skipped => self.skipped += 1,
            DispatchOutcome::Delivered => self.delivered += 1,
            DispatchOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Pull-path worker with a bounded batch and bounded concurrency.
pub struct Reconciler {
    dispatcher: Dispatcher,
    interactions: InteractionRepo,
    batch_size: u32,
    max_concurrency: usize,
    stale_claim: chrono::Duration,
}

impl Reconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(dispatcher: Dispatcher, interactions: InteractionRepo, config: &PollerConfig) -> Self {
        let stale_secs = i64::try_from(config.stale_claim_seconds).unwrap_or(i64::MAX);
        Self {
            dispatcher,
            interactions,
            batch_size: config.batch_size,
            max_concurrency: config.max_concurrency.max(1),
            stale_claim: chrono::Duration::seconds(stale_secs),
        }
    }

    /// Run one reconcile pass.
    ///
    /// Zero due rows is a no-op. The first infrastructure error stops new
    /// claims in this tick; claims already running finish.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be queried or a claim or
    /// finalize write fails.
    pub async fn tick(&self, source: ClaimSource) -> Result<TickSummary> {
        let now = Utc::now();
        let mut summary = TickSummary {
            expired_claims: self.interactions.fail_stale_claims(now - self.stale_claim).await?,
            ..TickSummary::default()
        };
        if summary.expired_claims > 0 {
            warn!(count = summary.expired_claims, "stale claims failed");
        }

        let due = self
            .interactions
            .list_due(self.dispatcher.due_by(now), self.batch_size)
            .await?;
        if due.is_empty() {
            debug!("no due interactions");
            return Ok(summary);
        }
        debug!(count = due.len(), "due interactions found");

        let abort = AtomicBool::new(false);
        let results: Vec<Result<Option<DispatchOutcome>>> = stream::iter(due)
            .map(|item| {
                let abort = &abort;
                async move {
                    if abort.load(Ordering::Acquire) {
                        return Ok(None);
                    }
                    let result = self.dispatcher.claim_and_deliver(&item.id, source).await;
                    if let Err(ref err) = result {
                        if err.is_infrastructure() {
                            abort.store(true, Ordering::Release);
                        }
                    }
                    result.map(Some)
                }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(Some(outcome)) => summary.record(&outcome),
                Ok(None) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            warn!(
                %err,
                delivered = summary.delivered,
                failed = summary.failed,
                "reconcile tick aborted"
            );
            return Err(err);
        }

        info!(
            processed = summary.processed,
            delivered = summary.delivered,
            failed = summary.failed,
            skipped = summary.skipped,
            "reconcile tick completed"
        );
        Ok(summary)
    }
}

/// Spawn the background poller running one tick per `interval`.
///
/// A tick in progress when `cancel` fires runs to completion.
#[must_use]
pub fn spawn_reconciler(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("reconciler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = reconciler.tick(ClaimSource::Poller).await {
                        error!(%err, "reconcile tick failed; retrying next interval");
                    }
                }
            }
        }
    })
}

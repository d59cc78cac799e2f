//! Claim-then-deliver, shared by the broker consumer, the reconciling
//! poller and manual reconciles.
//!
//! 1. Claim with one conditional update. Losing the claim ends the call
//!    with no side effects.
//! 2. Load the lead, organization, AI configuration and status taxonomy.
//! 3. Call the delivery target once.
//! 4. Mark the row `delivered` and advance the lead, or mark it `failed`.
//!
//! Once a claim is won every outcome of steps 2 and 3 is terminal. Only a
//! store failure while claiming or finalizing propagates as an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn, Instrument};

use crate::config::DeliveryConfig;
use crate::delivery::{DeliveryTarget, InteractionContext};
use crate::models::interaction::ClaimSource;
use crate::models::lead::{Lead, LeadStatusTaxonomy};
use crate::persistence::db::Database;
use crate::persistence::interaction_repo::InteractionRepo;
use crate::persistence::lead_repo::LeadRepo;
use crate::{AppError, Result};

/// Lead status assumed as the entry status when a taxonomy defines none.
const FALLBACK_NEW_KEY: &str = "new";

/// Result of one claim-then-deliver attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Claim not won: already claimed, finalized, not yet due, or unknown.
    Skipped,
    /// Delivered and finalized.
    Delivered,
    /// Finalized as failed with the recorded reason.
    Failed(String),
}

/// Runs claim-then-deliver against the Durable Store and a delivery target.
#[derive(Clone)]
pub struct Dispatcher {
    interactions: InteractionRepo,
    leads: LeadRepo,
    target: Arc<dyn DeliveryTarget>,
    default_webhook_url: Option<String>,
    early_tolerance: chrono::Duration,
}

impl Dispatcher {
    /// Build a dispatcher over the shared database.
    #[must_use]
    pub fn new(db: Arc<Database>, target: Arc<dyn DeliveryTarget>, config: &DeliveryConfig) -> Self {
        let tolerance_ms = i64::try_from(config.early_tolerance_ms).unwrap_or(i64::MAX);
        Self {
            interactions: InteractionRepo::new(Arc::clone(&db)),
            leads: LeadRepo::new(db),
            target,
            default_webhook_url: config.webhook_url.clone(),
            early_tolerance: chrono::Duration::milliseconds(tolerance_ms),
        }
    }

    /// Latest `scheduled_at` a claim made at `now` accepts.
    #[must_use]
    pub fn due_by(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.early_tolerance
    }

    /// Claim `id` and, if won, deliver it exactly once.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the claim or the finalizing write fails.
    /// Missing data and delivery errors are recorded on the row and
    /// reported as [`DispatchOutcome::Failed`].
    pub async fn claim_and_deliver(&self, id: &str, source: ClaimSource) -> Result<DispatchOutcome> {
        let span = tracing::info_span!("dispatch", interaction_id = %id, ?source);
        self.run(id, source).instrument(span).await
    }

    async fn run(&self, id: &str, source: ClaimSource) -> Result<DispatchOutcome> {
        if !self.interactions.claim(id, self.due_by(Utc::now()), source).await? {
            debug!("claim not won; skipping");
            return Ok(DispatchOutcome::Skipped);
        }
        info!("interaction claimed");

        match self.deliver_claimed(id).await {
            Ok((lead, taxonomy)) => {
                if !self.interactions.mark_delivered(id).await? {
                    warn!("row left claimed state before finalize; delivery already happened");
                }
                info!("interaction delivered");
                self.advance_lead(&lead, &taxonomy).await;
                Ok(DispatchOutcome::Delivered)
            }
            Err(err) => {
                let reason = err.to_string();
                if !self.interactions.mark_failed(id, &reason).await? {
                    warn!("row left claimed state before finalize");
                }
                warn!(%reason, "interaction failed");
                Ok(DispatchOutcome::Failed(reason))
            }
        }
    }

    async fn deliver_claimed(&self, id: &str) -> Result<(Lead, LeadStatusTaxonomy)> {
        let item = self
            .interactions
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::Precondition(format!("interaction {id} disappeared")))?;

        let lead = self
            .leads
            .get_lead(&item.lead_id)
            .await?
            .ok_or_else(|| AppError::Precondition(format!("lead {} not found", item.lead_id)))?;

        let organization = self
            .leads
            .get_organization(&lead.organization_id)
            .await?
            .ok_or_else(|| {
                AppError::Precondition(format!("organization {} not found", lead.organization_id))
            })?;

        let ai_configuration = self
            .leads
            .get_ai_configuration(&item.ai_configuration_id)
            .await?
            .ok_or_else(|| {
                AppError::Precondition(format!(
                    "ai configuration {} not found",
                    item.ai_configuration_id
                ))
            })?;
        if ai_configuration.organization_id != lead.organization_id {
            return Err(AppError::Precondition(format!(
                "ai configuration {} belongs to another organization",
                ai_configuration.id
            )));
        }

        let url = ai_configuration
            .webhook_url
            .clone()
            .or_else(|| self.default_webhook_url.clone())
            .ok_or_else(|| AppError::Precondition("delivery target not configured".into()))?;

        let taxonomy = self.leads.list_statuses(&organization.id).await?;
        let context = InteractionContext::new(
            &item,
            lead.clone(),
            organization,
            ai_configuration,
            taxonomy.clone(),
        );

        self.target.deliver(&url, &context).await?;
        Ok((lead, taxonomy))
    }

    /// Move the lead out of its entry status. Runs after the interaction is
    /// already `delivered`; a failure here is logged, not propagated.
    async fn advance_lead(&self, lead: &Lead, taxonomy: &LeadStatusTaxonomy) {
        let from = taxonomy.new_key().unwrap_or(FALLBACK_NEW_KEY);
        let to = taxonomy.conversation_started_key();

        match self.leads.advance_status(&lead.id, from, to).await {
            Ok(true) => info!(lead_id = %lead.id, from, to, "lead status advanced"),
            Ok(false) => debug!(lead_id = %lead.id, from, "lead not in entry status; unchanged"),
            Err(err) => error!(lead_id = %lead.id, %err, "lead status advance failed"),
        }
    }
}

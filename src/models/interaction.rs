//! Scheduled interaction model and its forward-only status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Lifecycle status for a scheduled interaction.
///
/// Moves strictly forward: `pending → claimed → {delivered | failed}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    /// Created by the scheduling caller; claimable once due.
    Pending,
    /// Exactly one actor won the claim and is delivering.
    Claimed,
    /// Delivery target acknowledged success.
    Delivered,
    /// Delivery or a precondition failed; never retried.
    Failed,
}

/// Which execution path won the claim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimSource {
    /// Broker consumer (push path).
    Broker,
    /// Background reconciling poller (pull path).
    Poller,
    /// Operator-triggered reconcile via HTTP or IPC.
    Manual,
}

/// Inbound scheduling request from the UI/API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    /// Lead to contact.
    pub lead_id: String,
    /// AI configuration driving the conversation.
    pub ai_configuration_id: String,
    /// Messaging channel instance used to reach the lead.
    pub channel_instance: String,
    /// Channel-specific endpoint for the lead (e.g. phone JID).
    pub destination_address: String,
    /// When to fire; a past timestamp means as soon as possible.
    pub scheduled_at: DateTime<Utc>,
}

impl ScheduleRequest {
    /// Reject requests with blank identifiers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` naming the first blank field.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("leadId", &self.lead_id),
            ("aiConfigurationId", &self.ai_configuration_id),
            ("channelInstance", &self.channel_instance),
            ("destinationAddress", &self.destination_address),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(AppError::Validation(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }
}

/// A one-shot outbound interaction scheduled for a lead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledInteraction {
    /// Unique record identifier.
    pub id: String,
    /// Lead to contact.
    pub lead_id: String,
    /// AI configuration driving the conversation.
    pub ai_configuration_id: String,
    /// Messaging channel instance.
    pub channel_instance: String,
    /// Channel-specific endpoint for the lead.
    pub destination_address: String,
    /// Absolute fire time.
    pub scheduled_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: InteractionStatus,
    /// When the claim succeeded.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Path that won the claim.
    pub claimed_by: Option<ClaimSource>,
    /// Terminal failure reason.
    pub last_error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl ScheduledInteraction {
    /// Construct a new pending interaction from a scheduling request.
    #[must_use]
    pub fn new(request: ScheduleRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            lead_id: request.lead_id,
            ai_configuration_id: request.ai_configuration_id,
            channel_instance: request.channel_instance,
            destination_address: request.destination_address,
            scheduled_at: request.scheduled_at,
            status: InteractionStatus::Pending,
            claimed_at: None,
            claimed_by: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

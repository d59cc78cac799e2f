//! Context payload handed to the delivery target.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::interaction::ScheduledInteraction;
use crate::models::lead::{AiConfiguration, Lead, LeadStatusTaxonomy, Organization};

/// Marker value identifying a proactively scheduled trigger.
pub const SCHEDULED_TRIGGER: &str = "scheduled_interaction";

/// Synthetic message standing in for the inbound message the AI service
/// normally reacts to.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMessage {
    /// Always [`SCHEDULED_TRIGGER`].
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Scheduled triggers are outbound; never from the lead.
    pub from_lead: bool,
    /// Channel instance to send through.
    pub channel_instance: String,
    /// Lead endpoint on that channel.
    pub destination_address: String,
    /// When the trigger was fired.
    pub triggered_at: DateTime<Utc>,
}

/// Interaction fields relevant to the AI service.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InteractionSnapshot {
    /// Scheduled interaction identifier.
    pub id: String,
    /// Requested fire time.
    pub scheduled_at: DateTime<Utc>,
}

/// Everything the AI service needs to open the conversation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InteractionContext {
    /// Synthetic trigger message.
    pub message: TriggerMessage,
    /// Which scheduled interaction fired.
    pub interaction: InteractionSnapshot,
    /// Lead snapshot.
    pub lead: Lead,
    /// Organization snapshot.
    pub organization: Organization,
    /// AI configuration snapshot.
    pub ai_configuration: AiConfiguration,
    /// Organization's lead-status taxonomy.
    pub lead_statuses: LeadStatusTaxonomy,
}

impl InteractionContext {
    /// Assemble the payload for one claimed interaction.
    #[must_use]
    pub fn new(
        item: &ScheduledInteraction,
        lead: Lead,
        organization: Organization,
        ai_configuration: AiConfiguration,
        lead_statuses: LeadStatusTaxonomy,
    ) -> Self {
        Self {
            message: TriggerMessage {
                kind: SCHEDULED_TRIGGER,
                from_lead: false,
                channel_instance: item.channel_instance.clone(),
                destination_address: item.destination_address.clone(),
                triggered_at: Utc::now(),
            },
            interaction: InteractionSnapshot {
                id: item.id.clone(),
                scheduled_at: item.scheduled_at,
            },
            lead,
            organization,
            ai_configuration,
            lead_statuses,
        }
    }
}

//! Broker-resident projection of a scheduled interaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::interaction::ScheduledInteraction;
use crate::Result;

/// Message published to the delay topology.
///
/// Carries identifiers only; the Durable Store remains the source of truth,
/// so losing or duplicating one of these never corrupts delivery state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DelayQueueMessage {
    /// Scheduled interaction identifier.
    pub interaction_id: String,
    /// Lead identifier.
    pub lead_id: String,
    /// AI configuration identifier.
    pub ai_configuration_id: String,
    /// Messaging channel instance.
    pub channel_instance: String,
    /// Channel-specific endpoint for the lead.
    pub destination_address: String,
    /// Absolute fire time.
    pub scheduled_at: DateTime<Utc>,
}

impl DelayQueueMessage {
    /// Serialize to the JSON wire payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Codec` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a JSON wire payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Codec` if the payload is not a valid message.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl From<&ScheduledInteraction> for DelayQueueMessage {
    fn from(item: &ScheduledInteraction) -> Self {
        Self {
            interaction_id: item.id.clone(),
            lead_id: item.lead_id.clone(),
            ai_configuration_id: item.ai_configuration_id.clone(),
            channel_instance: item.channel_instance.clone(),
            destination_address: item.destination_address.clone(),
            scheduled_at: item.scheduled_at,
        }
    }
}

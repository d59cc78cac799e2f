//! Publishes scheduling signals into the delay topology.
//!
//! The publisher never writes to the Durable Store. Callers create the
//! `pending` row first; a lost or rejected publish leaves that row for the
//! reconciling poller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Route, Topology};
use crate::models::interaction::ScheduledInteraction;
use crate::models::message::DelayQueueMessage;
use crate::{AppError, Result};

/// Per-item publish result.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublishItemOutcome {
    /// Interaction identifier.
    pub id: String,
    /// Whether the broker took the message.
    pub accepted: bool,
    /// Rejection reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tally of a batch publish.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Items the broker took.
    pub accepted: usize,
    /// Items the broker rejected individually.
    pub rejected: usize,
    /// Per-item detail in input order.
    pub items: Vec<PublishItemOutcome>,
}

/// Routes interactions to the ready exchange or a delay queue.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    topology: Topology,
}

impl Publisher {
    /// Create a publisher over an already-ensured topology.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, topology: Topology) -> Self {
        Self { broker, topology }
    }

    /// Publish one interaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Broker` if the broker rejected the message, or
    /// `AppError::BrokerUnavailable` if the broker is unreachable.
    pub async fn schedule(&self, item: &ScheduledInteraction) -> Result<()> {
        self.publish_at(item, Utc::now()).await
    }

    /// Publish many interactions; one rejection does not stop the rest.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BrokerUnavailable` as a single error for the whole
    /// batch when connectivity is lost. Items not yet published stay
    /// `pending` and remain reachable by the poller.
    pub async fn schedule_batch(&self, items: &[ScheduledInteraction]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        for item in items {
            match self.publish_at(item, Utc::now()).await {
                Ok(()) => {
                    outcome.accepted += 1;
                    outcome.items.push(PublishItemOutcome {
                        id: item.id.clone(),
                        accepted: true,
                        error: None,
                    });
                }
                Err(err @ AppError::BrokerUnavailable(_)) => {
                    warn!(%err, published = outcome.accepted, "broker lost mid-batch");
                    return Err(err);
                }
                Err(err) => {
                    warn!(interaction_id = %item.id, %err, "publish rejected");
                    outcome.rejected += 1;
                    outcome.items.push(PublishItemOutcome {
                        id: item.id.clone(),
                        accepted: false,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        info!(
            accepted = outcome.accepted,
            rejected = outcome.rejected,
            "batch published"
        );
        Ok(outcome)
    }

    async fn publish_at(&self, item: &ScheduledInteraction, now: DateTime<Utc>) -> Result<()> {
        let payload = DelayQueueMessage::from(item).encode()?;

        match self.topology.route(item.scheduled_at, now) {
            Route::Ready => {
                debug!(interaction_id = %item.id, "already due; publishing ready");
                self.broker
                    .publish(
                        &self.topology.ready_exchange,
                        &self.topology.routing_key,
                        &payload,
                        None,
                    )
                    .await
            }
            Route::Delayed { queue, ttl } => {
                let delay_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
                debug!(interaction_id = %item.id, %queue, delay_ms, "publishing delayed");
                self.broker.publish("", &queue, &payload, Some(ttl)).await
            }
        }
    }
}

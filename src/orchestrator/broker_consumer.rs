//! Broker consumer: the push path.
//!
//! Drains the destination queue one message at a time and runs
//! claim-then-deliver for the interaction each message names. A message is
//! acknowledged only after that completes, so a crash mid-delivery causes a
//! redelivery that the conditional claim turns into a no-op.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatcher::{DispatchOutcome, Dispatcher};
use crate::broker::{Broker, InboundMessage, Subscription};
use crate::models::interaction::ClaimSource;
use crate::models::message::DelayQueueMessage;
use crate::{AppError, Result};

/// Initial delay before resubscribing after a lost subscription.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for the resubscribe backoff.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

enum SessionEnd {
    Cancelled,
    Closed,
    Lost(AppError),
}

/// Spawn the consumer loop on `queue`.
///
/// Runs until `cancel` fires, resubscribing with exponential backoff
/// whenever the subscription is lost or an infrastructure error interrupts
/// processing. The message being processed when `cancel` fires is finished
/// and settled first.
#[must_use]
pub fn spawn_broker_consumer(
    broker: Arc<dyn Broker>,
    queue: String,
    prefetch: u16,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = INITIAL_RETRY_DELAY;
        loop {
            let subscribed = tokio::select! {
                () = cancel.cancelled() => break,
                result = broker.subscribe(&queue, prefetch) => result,
            };

            match subscribed {
                Ok(mut subscription) => {
                    info!(%queue, prefetch, "broker consumer subscribed");
                    match consume(subscription.as_mut(), &dispatcher, &cancel, &mut backoff).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Closed => info!(%queue, "subscription closed by broker"),
                        SessionEnd::Lost(err) => warn!(%err, "broker consumer interrupted"),
                    }
                }
                Err(err) => warn!(%err, "broker subscribe failed"),
            }

            debug!(delay_ms = backoff.as_millis(), "resubscribing after backoff");
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_RETRY_DELAY);
        }
        info!("broker consumer shutting down");
    })
}

async fn consume(
    subscription: &mut dyn Subscription,
    dispatcher: &Dispatcher,
    cancel: &CancellationToken,
    backoff: &mut Duration,
) -> SessionEnd {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return SessionEnd::Cancelled,
            next = subscription.next_message() => next,
        };

        let message = match next {
            Ok(Some(message)) => message,
            Ok(None) => return SessionEnd::Closed,
            Err(err) => return SessionEnd::Lost(err),
        };

        match handle_message(message, dispatcher).await {
            Ok(()) => *backoff = INITIAL_RETRY_DELAY,
            Err(err) if err.is_infrastructure() => return SessionEnd::Lost(err),
            Err(err) => warn!(%err, "failed to settle broker message"),
        }
    }
}

/// Process one delivery and settle it with the broker.
///
/// Undecodable payloads are dropped without requeue; the poller still
/// reaches the row. An infrastructure error requeues the message and is
/// returned so the caller backs off.
async fn handle_message(message: InboundMessage, dispatcher: &Dispatcher) -> Result<()> {
    let decoded = match DelayQueueMessage::decode(&message.payload) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(%err, "undecodable broker payload; dropping");
            return message.reject(false).await;
        }
    };

    if message.redelivered {
        debug!(interaction_id = %decoded.interaction_id, "redelivered message");
    }

    match dispatcher
        .claim_and_deliver(&decoded.interaction_id, ClaimSource::Broker)
        .await
    {
        Ok(outcome) => {
            if outcome == DispatchOutcome::Skipped {
                debug!(interaction_id = %decoded.interaction_id, "message for unclaimable interaction");
            }
            message.ack().await
        }
        Err(err) => {
            if let Err(settle_err) = message.reject(true).await {
                warn!(%settle_err, "requeue after infrastructure error failed");
            }
            Err(err)
        }
    }
}

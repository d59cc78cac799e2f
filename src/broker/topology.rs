//! Delay topology naming and per-message routing.
//!
//! ```text
//!   publish(delay <= 0) ───────────────────────────────┐
//!                                                     ▼
//!   publish(delay > 0) ─▶ delay queue (TTL) ─expire─▶ ready exchange ─key─▶ destination queue
//! ```
//!
//! RabbitMQ only expires messages at the head of a queue, so a short-TTL
//! message queued behind a long-TTL one waits for the long one. Delay
//! queues are therefore split into tiers: a message goes to the smallest
//! tier whose bound covers its delay, which caps the skew at that tier's
//! width. With no tiers configured a single delay queue is used and the
//! head-of-line blocking is unbounded.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::BrokerConfig;

/// One delay queue and the largest delay it accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayQueue {
    /// Queue name.
    pub name: String,
    /// Largest delay routed here; `None` for the overflow / single queue.
    pub max_delay: Option<Duration>,
}

/// Where a message is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Straight to the ready exchange; consumable immediately.
    Ready,
    /// Into a delay queue with a per-message TTL.
    Delayed {
        /// Delay queue name (addressed through the default exchange).
        queue: String,
        /// Per-message TTL.
        ttl: Duration,
    },
}

/// Broker resource names and delay tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Direct exchange receiving ready messages.
    pub ready_exchange: String,
    /// Queue consumed by the broker consumer.
    pub destination_queue: String,
    /// Binding key between `ready_exchange` and `destination_queue`.
    pub routing_key: String,
    delay_queues: Vec<DelayQueue>,
}

impl Topology {
    /// Derive the topology from broker configuration.
    #[must_use]
    pub fn from_config(config: &BrokerConfig) -> Self {
        let base = &config.delay_queue;
        let delay_queues = if config.delay_tiers_seconds.is_empty() {
            vec![DelayQueue {
                name: base.clone(),
                max_delay: None,
            }]
        } else {
            config
                .delay_tiers_seconds
                .iter()
                .map(|secs| DelayQueue {
                    name: format!("{base}.{secs}s"),
                    max_delay: Some(Duration::from_secs(*secs)),
                })
                .chain(std::iter::once(DelayQueue {
                    name: format!("{base}.overflow"),
                    max_delay: None,
                }))
                .collect()
        };

        Self {
            ready_exchange: config.ready_exchange.clone(),
            destination_queue: config.destination_queue.clone(),
            routing_key: config.routing_key.clone(),
            delay_queues,
        }
    }

    /// Every delay queue to declare, smallest tier first.
    #[must_use]
    pub fn delay_queues(&self) -> &[DelayQueue] {
        &self.delay_queues
    }

    /// Decide where a message scheduled for `scheduled_at` goes at `now`.
    #[must_use]
    pub fn route(&self, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Route {
        let delay = delay_until(scheduled_at, now);
        if delay.is_zero() {
            return Route::Ready;
        }

        // The last queue is unbounded, so `find` always succeeds.
        let queue = self
            .delay_queues
            .iter()
            .find(|q| q.max_delay.map_or(true, |max| delay <= max))
            .map_or_else(String::new, |q| q.name.clone());

        Route::Delayed { queue, ttl: delay }
    }
}

/// `max(0, scheduled_at - now)` rounded to whole milliseconds.
#[must_use]
pub fn delay_until(scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let delta = scheduled_at - now;
    let millis = delta
        .num_microseconds()
        .map_or_else(|| delta.num_milliseconds(), |us| (us + 500).div_euclid(1000));
    u64::try_from(millis).map_or(Duration::ZERO, Duration::from_millis)
}

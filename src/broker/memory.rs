//! In-process broker reproducing the RabbitMQ semantics the pipeline relies on.
//!
//! Modelled behaviour:
//! - direct exchanges route by exact binding key; the default exchange (`""`)
//!   routes by queue name; unroutable messages are dropped
//! - per-message TTL counts down from enqueue time, but a message only
//!   expires once it reaches the head of its queue
//! - expired messages are dead-lettered to the queue's configured exchange
//!   and key, losing their TTL on the way
//! - unacknowledged deliveries count against prefetch and return to the
//!   queue head, flagged redelivered, on reject-with-requeue or consumer loss
//!
//! Time is `tokio::time::Instant`, so tests can drive expiry with
//! `tokio::time::pause` / `advance`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Acknowledger, BoxFuture, Broker, InboundMessage, Subscription, Topology};
use crate::{AppError, Result};

const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct Envelope {
    payload: Vec<u8>,
    expires_at: Option<Instant>,
    redelivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DeadLetter {
    exchange: String,
    routing_key: String,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    unacked: HashMap<u64, Envelope>,
    dead_letter: Option<DeadLetter>,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// exchange name -> (binding key, queue name)
    bindings: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    offline: bool,
    closed: bool,
}

impl BrokerState {
    fn ensure_online(&self) -> Result<()> {
        if self.offline || self.closed {
            Err(AppError::BrokerUnavailable(
                "memory broker connection is down".into(),
            ))
        } else {
            Ok(())
        }
    }

    fn declare_queue(&mut self, name: &str, dead_letter: Option<DeadLetter>) -> Result<()> {
        match self.queues.get(name) {
            Some(existing) if existing.dead_letter != dead_letter => Err(AppError::Broker(
                format!("queue '{name}' redeclared with different arguments"),
            )),
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    name.to_owned(),
                    QueueState {
                        dead_letter,
                        ..QueueState::default()
                    },
                );
                Ok(())
            }
        }
    }

    fn bind(&mut self, exchange: &str, routing_key: &str, queue: &str) {
        let bindings = self.bindings.entry(exchange.to_owned()).or_default();
        if !bindings
            .iter()
            .any(|(key, name)| key == routing_key && name == queue)
        {
            bindings.push((routing_key.to_owned(), queue.to_owned()));
        }
    }

    /// Route an envelope, returning how many queues received it.
    fn route(&mut self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<usize> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            self.bindings
                .get(exchange)
                .ok_or_else(|| AppError::Broker(format!("no exchange '{exchange}'")))?
                .iter()
                .filter(|(key, _)| key == routing_key)
                .map(|(_, queue)| queue.clone())
                .collect()
        };

        let mut reached = 0;
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(envelope.clone());
                reached += 1;
            }
        }
        Ok(reached)
    }

    /// Dead-letter every expired message currently at a queue head.
    fn expire_heads(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (name, queue) in &mut self.queues {
            while queue
                .ready
                .front()
                .is_some_and(|env| env.expires_at.is_some_and(|at| at <= now))
            {
                let Some(mut envelope) = queue.ready.pop_front() else {
                    break;
                };
                envelope.expires_at = None;
                match queue.dead_letter {
                    Some(ref dlx) => expired.push((dlx.clone(), envelope)),
                    None => debug!(queue = %name, "expired message discarded"),
                }
            }
        }

        for (dlx, envelope) in expired {
            match self.route(&dlx.exchange, &dlx.routing_key, &envelope) {
                Ok(0) | Err(_) => {
                    warn!(exchange = %dlx.exchange, key = %dlx.routing_key, "dead-lettered message unroutable");
                }
                Ok(_) => {}
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.queues
            .values()
            .filter_map(|q| q.ready.front().and_then(|env| env.expires_at))
            .min()
    }
}

/// Shared in-process broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    /// Create an empty broker with no exchanges or queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages in `queue` ready for delivery, after processing expiries.
    pub async fn ready_count(&self, queue: &str) -> usize {
        let mut state = self.state.lock().await;
        state.expire_heads(Instant::now());
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` but not yet settled.
    pub async fn unacked_count(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Simulate losing (or regaining) the broker connection.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
        self.notify.notify_waiters();
    }

    /// Drop every ready message in `queue`, returning how many were lost.
    pub async fn purge(&self, queue: &str) -> usize {
        let mut state = self.state.lock().await;
        state.queues.get_mut(queue).map_or(0, |q| {
            let lost = q.ready.len();
            q.ready.clear();
            lost
        })
    }

    /// Return every unacknowledged delivery of `queue` to its head, as the
    /// broker does when a consumer's channel dies.
    pub async fn requeue_unacked(&self, queue: &str) -> usize {
        let mut state = self.state.lock().await;
        let Some(q) = state.queues.get_mut(queue) else {
            return 0;
        };
        let mut pending: Vec<(u64, Envelope)> = q.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| *tag);
        let count = pending.len();
        for (_, mut envelope) in pending.into_iter().rev() {
            envelope.redelivered = true;
            q.ready.push_front(envelope);
        }
        drop(state);
        self.notify.notify_waiters();
        count
    }

    /// Close the broker; subscriptions end with `Ok(None)`.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }
}

impl Broker for MemoryBroker {
    fn ensure_topology<'a>(&'a self, topology: &'a Topology) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.ensure_online()?;

            state
                .bindings
                .entry(topology.ready_exchange.clone())
                .or_default();
            state.declare_queue(&topology.destination_queue, None)?;
            state.bind(
                &topology.ready_exchange,
                &topology.routing_key,
                &topology.destination_queue,
            );

            for delay_queue in topology.delay_queues() {
                state.declare_queue(
                    &delay_queue.name,
                    Some(DeadLetter {
                        exchange: topology.ready_exchange.clone(),
                        routing_key: topology.routing_key.clone(),
                    }),
                )?;
            }
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: &'a [u8],
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.ensure_online()?;

            let envelope = Envelope {
                payload: payload.to_vec(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
                redelivered: false,
            };
            if state.route(exchange, routing_key, &envelope)? == 0 {
                warn!(exchange, routing_key, "message unroutable; dropped");
            }
            drop(state);
            self.notify.notify_waiters();
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<Box<dyn Subscription>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            state.ensure_online()?;
            if !state.queues.contains_key(queue) {
                return Err(AppError::Broker(format!("no queue '{queue}'")));
            }
            let subscription: Box<dyn Subscription> = Box::new(MemorySubscription {
                state: Arc::clone(&self.state),
                notify: Arc::clone(&self.notify),
                queue: queue.to_owned(),
                prefetch: usize::from(prefetch.max(1)),
            });
            Ok(subscription)
        })
    }
}

struct MemorySubscription {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    queue: String,
    prefetch: usize,
}

impl Subscription for MemorySubscription {
    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<InboundMessage>>> {
        Box::pin(async move {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let wake_at = {
                    let mut state = self.state.lock().await;
                    if state.closed {
                        return Ok(None);
                    }
                    state.ensure_online()?;
                    state.expire_heads(Instant::now());

                    state.next_tag += 1;
                    let tag = state.next_tag;
                    let queue = state
                        .queues
                        .get_mut(&self.queue)
                        .ok_or_else(|| AppError::Broker(format!("no queue '{}'", self.queue)))?;

                    if queue.unacked.len() < self.prefetch {
                        if let Some(envelope) = queue.ready.pop_front() {
                            queue.unacked.insert(tag, envelope.clone());
                            let acker = MemoryAcker {
                                state: Arc::clone(&self.state),
                                notify: Arc::clone(&self.notify),
                                queue: self.queue.clone(),
                                tag,
                            };
                            return Ok(Some(InboundMessage::new(
                                envelope.payload,
                                envelope.redelivered,
                                Box::new(acker),
                            )));
                        }
                    }
                    state.next_expiry()
                };

                let idle_deadline = Instant::now() + IDLE_POLL;
                let deadline = wake_at.map_or(idle_deadline, |at| at.min(idle_deadline));
                tokio::select! {
                    () = &mut notified => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
        })
    }
}

struct MemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    async fn settle(&self, requeue: Option<bool>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_online()?;
        let envelope = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.tag))
            .ok_or_else(|| AppError::Broker(format!("unknown delivery tag {}", self.tag)))?;

        if requeue == Some(true) {
            if let Some(q) = state.queues.get_mut(&self.queue) {
                q.ready.push_front(Envelope {
                    redelivered: true,
                    ..envelope
                });
            }
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }
}

impl Acknowledger for MemoryAcker {
    fn ack(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.settle(None))
    }

    fn reject(&self, requeue: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.settle(Some(requeue)))
    }
}

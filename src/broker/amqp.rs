//! RabbitMQ transport built on `lapin`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Acknowledger, BoxFuture, Broker, InboundMessage, Subscription, Topology};
use crate::{AppError, Result};

const PERSISTENT: u8 = 2;
const CONSUMER_TAG: &str = "interaction-relay";

/// One live connection and its confirm-mode publish channel.
#[derive(Clone)]
struct Session {
    connection: Arc<Connection>,
    channel: Channel,
}

impl Session {
    async fn open(uri: &str) -> Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|err| AppError::BrokerUnavailable(format!("amqp connect failed: {err}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| AppError::BrokerUnavailable(format!("amqp channel failed: {err}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| AppError::BrokerUnavailable(format!("amqp confirm mode failed: {err}")))?;
        Ok(Self {
            connection: Arc::new(connection),
            channel,
        })
    }

    fn is_alive(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    /// Distinguish a lost connection from a rejection of one operation.
    fn classify(&self, err: &lapin::Error) -> AppError {
        if self.is_alive() {
            AppError::Broker(err.to_string())
        } else {
            AppError::BrokerUnavailable(err.to_string())
        }
    }

    async fn declare(&self, topology: &Topology) -> Result<()> {
        self.channel
            .exchange_declare(
                &topology.ready_exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| self.classify(&err))?;

        self.channel
            .queue_declare(&topology.destination_queue, durable_queue(), FieldTable::default())
            .await
            .map_err(|err| self.classify(&err))?;

        self.channel
            .queue_bind(
                &topology.destination_queue,
                &topology.ready_exchange,
                &topology.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| self.classify(&err))?;

        for delay_queue in topology.delay_queues() {
            self.channel
                .queue_declare(&delay_queue.name, durable_queue(), dead_letter_args(topology))
                .await
                .map_err(|err| self.classify(&err))?;
        }
        Ok(())
    }
}

struct ConnectionState {
    session: Option<Session>,
    /// Declared again on every new connection.
    topology: Option<Topology>,
}

/// Broker over one AMQP connection, reopened lazily after it is lost.
///
/// lapin does not reconnect on its own. Every operation checks the current
/// session first; a dead one is replaced and the last ensured topology is
/// declared again before the operation proceeds.
pub struct AmqpBroker {
    uri: String,
    state: Mutex<ConnectionState>,
}

impl AmqpBroker {
    /// Connect and open a publisher-confirm channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BrokerUnavailable` if the connection or channel
    /// cannot be established.
    pub async fn connect(uri: &str) -> Result<Self> {
        let session = Session::open(uri).await?;
        info!("amqp broker connected");
        Ok(Self {
            uri: uri.to_owned(),
            state: Mutex::new(ConnectionState {
                session: Some(session),
                topology: None,
            }),
        })
    }

    /// Close the current connection. A later operation opens a new one.
    pub async fn close(&self) {
        let Some(session) = self.state.lock().await.session.take() else {
            return;
        };
        if let Err(err) = session.connection.close(200, "relay shutting down").await {
            debug!(%err, "amqp connection close failed");
        }
    }

    /// Current session, reconnecting first if the last one was lost.
    async fn session(&self) -> Result<Session> {
        let mut state = self.state.lock().await;
        if let Some(ref session) = state.session {
            if session.is_alive() {
                return Ok(session.clone());
            }
            warn!("amqp connection lost; reconnecting");
            state.session = None;
        }

        let session = Session::open(&self.uri).await?;
        if let Some(ref topology) = state.topology {
            session.declare(topology).await?;
        }
        info!("amqp broker reconnected");
        state.session = Some(session.clone());
        Ok(session)
    }
}

fn dead_letter_args(topology: &Topology) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(LongString::from(topology.ready_exchange.as_str())),
    );
    args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(LongString::from(topology.routing_key.as_str())),
    );
    args
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

impl Broker for AmqpBroker {
    fn ensure_topology<'a>(&'a self, topology: &'a Topology) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let session = self.session().await?;
            session.declare(topology).await?;
            self.state.lock().await.topology = Some(topology.clone());

            info!(
                exchange = %topology.ready_exchange,
                queue = %topology.destination_queue,
                delay_queues = topology.delay_queues().len(),
                "delay topology ensured"
            );
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
            let session = self.session().await?;
            let mut properties = BasicProperties::default()
                .with_delivery_mode(PERSISTENT)
                .with_content_type(ShortString::from("application/json"));
            if let Some(ttl) = ttl {
                properties =
                    properties.with_expiration(ShortString::from(ttl.as_millis().to_string()));
            }

            let confirmation = session
                .channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    properties,
                )
                .await
                .map_err(|err| session.classify(&err))?
                .await
                .map_err(|err| session.classify(&err))?;

            if confirmation.is_nack() {
                return Err(AppError::Broker(format!(
                    "publish to '{exchange}'/'{routing_key}' was nacked"
                )));
            }
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<Box<dyn Subscription>>> {
        Box::pin(async move {
            let session = self.session().await?;
            let channel = session
                .connection
                .create_channel()
                .await
                .map_err(|err| AppError::BrokerUnavailable(err.to_string()))?;
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|err| AppError::BrokerUnavailable(err.to_string()))?;
            let consumer = channel
                .basic_consume(
                    queue,
                    CONSUMER_TAG,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|err| AppError::BrokerUnavailable(err.to_string()))?;

            let subscription: Box<dyn Subscription> =
                Box::new(AmqpSubscription { channel, consumer });
            Ok(subscription)
        })
    }
}

struct AmqpSubscription {
    channel: Channel,
    consumer: lapin::Consumer,
}

impl Drop for AmqpSubscription {
    // Closing the channel returns its unacknowledged deliveries to the queue.
    fn drop(&mut self) {
        if !self.channel.status().connected() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let channel = self.channel.clone();
        runtime.spawn(async move {
            if let Err(err) = channel.close(200, "consumer released").await {
                debug!(%err, "amqp consumer channel close failed");
            }
        });
    }
}

impl Subscription for AmqpSubscription {
    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<InboundMessage>>> {
        Box::pin(async move {
            match self.consumer.next().await {
                None => Ok(None),
                Some(Err(err)) => {
                    warn!(%err, "amqp consumer stream failed");
                    Err(AppError::BrokerUnavailable(err.to_string()))
                }
                Some(Ok(delivery)) => Ok(Some(InboundMessage::new(
                    delivery.data,
                    delivery.redelivered,
                    Box::new(AmqpAcker(delivery.acker)),
                ))),
            }
        })
    }
}

struct AmqpAcker(lapin::acker::Acker);

impl Acknowledger for AmqpAcker {
    fn ack(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.0
                .ack(BasicAckOptions::default())
                .await
                .map(|_| ())
                .map_err(AppError::from)
        })
    }

    fn reject(&self, requeue: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.0
                .reject(BasicRejectOptions { requeue })
                .await
                .map(|_| ())
                .map_err(AppError::from)
        })
    }
}

//! RabbitMQ backend over `lapin`.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{acker::Acker, BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::QueueError;
use crate::traits::{Acknowledge, Delivery, Publisher, Subscription};

/// Connection to one fanout exchange. Publishes on a shared channel in
/// confirm mode; each subscription gets its own channel so prefetch is per
/// consumer.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    exchange: String,
}

impl AmqpBroker {
    pub async fn connect(uri: &str, exchange: &str) -> Result<Self, QueueError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(format!("failed to connect to RabbitMQ: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("failed to create channel: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::Provider(format!("confirm_select failed: {e}")))?;

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                QueueError::Provider(format!("failed to declare exchange {exchange}: {e}"))
            })?;

        info!(exchange, "Connected to RabbitMQ");
        Ok(Self {
            connection,
            channel,
            exchange: exchange.to_string(),
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Declare `<exchange>.queue` as a durable queue bound to this exchange,
    /// so published messages are kept until someone drains them.
    pub async fn bind_parking_queue(&self) -> Result<String, QueueError> {
        let queue = format!("{}.queue", self.exchange);
        self.channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Provider(format!("failed to declare queue {queue}: {e}")))?;
        self.channel
            .queue_bind(
                &queue,
                &self.exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Provider(format!("failed to bind {queue}: {e}")))?;
        info!(exchange = %self.exchange, queue = %queue, "Parking queue bound");
        Ok(queue)
    }

    /// Declare and bind the group's queue, then start consuming from it.
    ///
    /// A named group gets a durable queue shared by every worker using that
    /// name. An empty name gets a server-named queue deleted on disconnect.
    pub async fn subscribe(&self, group: &str, prefetch: u16) -> Result<AmqpSubscription, QueueError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("failed to create channel: {e}")))?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Provider(format!("basic_qos failed: {e}")))?;

        let options = if group.is_empty() {
            QueueDeclareOptions {
                auto_delete: true,
                exclusive: true,
                ..QueueDeclareOptions::default()
            }
        } else {
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            }
        };
        let queue = channel
            .queue_declare(group, options, FieldTable::default())
            .await
            .map_err(|e| QueueError::Provider(format!("failed to declare queue {group}: {e}")))?;
        let queue_name = queue.name().as_str().to_string();

        channel
            .queue_bind(
                &queue_name,
                &self.exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Provider(format!("failed to bind {queue_name}: {e}")))?;

        let consumer = channel
            .basic_consume(
                &queue_name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Provider(format!("basic_consume failed: {e}")))?;

        info!(exchange = %self.exchange, queue = %queue_name, prefetch, "Subscribed");
        Ok(AmqpSubscription {
            queue: queue_name,
            _channel: channel,
            consumer: Mutex::new(consumer),
        })
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }
}

impl AmqpBroker {
    /// Publish and wait for the broker's confirm.
    async fn send(&self, body: &[u8], mandatory: bool) -> Result<Confirmation, QueueError> {
        let confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                "",
                BasicPublishOptions {
                    mandatory,
                    ..BasicPublishOptions::default()
                },
                body,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| QueueError::Publish(format!("failed to publish message: {e}")))?
            .await
            .map_err(|e| QueueError::Publish(format!("publish not confirmed: {e}")))?;
        if let Confirmation::Nack(_) = confirm {
            return Err(QueueError::Publish(format!(
                "broker nacked publish to {}",
                self.exchange
            )));
        }
        debug!(exchange = %self.exchange, bytes = body.len(), mandatory, "Published");
        Ok(confirm)
    }
}

#[async_trait]
impl Publisher for AmqpBroker {
    async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError> {
        self.send(&body, false).await.map(|_| ())
    }

    /// Mandatory publish. An unroutable message comes back with the ack.
    async fn publish_routed(&self, body: Vec<u8>) -> Result<(), QueueError> {
        match self.send(&body, true).await? {
            Confirmation::Ack(Some(_)) => Err(QueueError::Unroutable(format!(
                "no queue bound to {}",
                self.exchange
            ))),
            _ => Ok(()),
        }
    }

    fn backend_name(&self) -> &'static str {
        "amqp"
    }
}

pub struct AmqpSubscription {
    queue: String,
    _channel: Channel,
    consumer: Mutex<lapin::Consumer>,
}

impl AmqpSubscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_delivery(&self) -> Option<Result<Delivery, QueueError>> {
        let next = self.consumer.lock().await.next().await?;
        Some(
            next.map(into_delivery)
                .map_err(|e| QueueError::Connection(format!("consumer stream error: {e}"))),
        )
    }
}

fn into_delivery(d: AmqpDelivery) -> Delivery {
    Delivery::new(
        d.delivery_tag,
        d.data,
        d.redelivered,
        Box::new(AmqpAcker { acker: d.acker }),
    )
}

/// Unsettled deliveries are returned by the broker when the channel closes.
struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }
}

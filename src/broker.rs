// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Channel Abstraction
//!
//! `Broker` is the set of channel operations the pipeline needs: topology
//! declaration, QoS, consuming, publishing, and settling deliveries by tag.
//! `LapinBroker` implements it over one lapin channel; every operation on that
//! channel goes through a single async lock, since a protocol channel must
//! not be driven by several tasks at once.

use crate::{
    envelope::{Envelope, Message, DELIVERY_MODE_TRANSIENT},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Stream of deliveries of one consumer. Ends when the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Message, AmqpError>>;

/// Channel-level operations against the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries in flight on this channel.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Publishes and waits for the broker confirm.
    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Last known channel state. Does not ask the broker.
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens a fresh broker channel. Called on startup and on every reconnect.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>, AmqpError>;
}

/// [`Broker`] over a lapin connection with a single channel.
pub struct LapinBroker {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
    ops: Mutex<()>,
}

impl LapinBroker {
    pub fn new(connection: Arc<Connection>, channel: Arc<Channel>) -> Self {
        LapinBroker {
            connection,
            channel,
            ops: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let _guard = self.ops.lock().await;
        debug!("creating exchange: {}", def.name);

        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let _guard = self.ops.lock().await;
        debug!("creating queue: {}", def.name);

        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                AmqpError::DeclareQueueError(def.name.clone())
            })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let _guard = self.ops.lock().await;

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        let _guard = self.ops.lock().await;

        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let _guard = self.ops.lock().await;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(message_from_delivery)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<(), AmqpError> {
        let confirm = {
            let _guard = self.ops.lock().await;
            self.channel
                .basic_publish(
                    exchange,
                    envelope.routing_key(),
                    BasicPublishOptions {
                        immediate: false,
                        mandatory: false,
                    },
                    envelope.payload(),
                    envelope.properties(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error publishing message");
                    AmqpError::PublishingError(err.to_string())
                })?
        };

        let confirmation = confirm.await.map_err(|err| {
            error!(error = err.to_string(), "error waiting for publish confirm");
            AmqpError::PublishingError(err.to_string())
        })?;

        if confirmation.is_nack() {
            return Err(AmqpError::PublishNacked);
        }

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let _guard = self.ops.lock().await;

        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let _guard = self.ops.lock().await;

        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let _guard = self.ops.lock().await;

        if self.channel.status().connected() {
            self.channel
                .close(200, "bye")
                .await
                .map_err(|err| AmqpError::ChannelError(err.to_string()))?;
        }

        if self.connection.status().connected() {
            self.connection
                .close(200, "bye")
                .await
                .map_err(|err| AmqpError::ConnectionError(err.to_string()))?;
        }

        Ok(())
    }
}

/// Converts a lapin delivery into the pipeline's message view.
fn message_from_delivery(delivery: Delivery) -> Message {
    let props = &delivery.properties;
    let mut envelope = Envelope::new(delivery.routing_key.as_str(), delivery.data.clone())
        .with_headers(
            props
                .headers()
                .as_ref()
                .map(|h| h.inner().clone())
                .unwrap_or_default(),
        );

    if let Some(content_type) = props.content_type() {
        envelope = envelope.with_content_type(content_type.as_str());
    }

    if props.delivery_mode() == &Some(DELIVERY_MODE_TRANSIENT) {
        envelope = envelope.transient();
    }

    if let Some(message_id) = props.message_id() {
        envelope = envelope.with_message_id(message_id.as_str());
    }

    if let Some(timestamp) = props.timestamp() {
        envelope = envelope.with_timestamp(*timestamp);
    }

    Message::new(
        delivery.delivery_tag,
        delivery.redelivered,
        delivery.exchange.as_str(),
        envelope,
    )
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Message Publisher
//!
//! Publishes JSON messages to one exchange. The exchange is declared on first
//! use, every send waits for the broker confirm under a deadline, and the
//! caller's OpenTelemetry context travels in the message headers.

use crate::{
    broker::{Broker, Connector},
    configs::AmqpConfigs,
    envelope::Envelope,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, OnceCell},
    time::timeout,
};
use tracing::{debug, error, warn};

/// Sends ready-made envelopes.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `envelope` and waits for the broker's confirmation.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context propagated in the message headers
    /// * `envelope` - The message to send
    ///
    /// # Returns
    /// Ok(()) once the broker confirmed, or the AmqpError that stopped it
    async fn publish_envelope(&self, ctx: &Context, envelope: Envelope) -> Result<(), AmqpError>;
}

/// Publisher bound to one exchange over its own broker connection.
///
/// The connection is opened and the exchange declared on the first publish.
/// After a failure the next publish reconnects once before giving up.
pub struct AmqpPublisher {
    connector: Arc<dyn Connector>,
    broker: Mutex<Option<Arc<dyn Broker>>>,
    exchange: ExchangeDefinition,
    routing_key: String,
    timeout: Duration,
    declared: OnceCell<()>,
    connected: AtomicBool,
}

impl AmqpPublisher {
    /// Creates a new publisher. Nothing is sent to the broker yet.
    ///
    /// # Parameters
    /// * `connector` - Opens the broker connection on first use
    /// * `exchange` - The exchange to declare and publish to
    /// * `routing_key` - Default routing key for [`publish`](Self::publish)
    ///
    /// # Returns
    /// A publisher with the default confirmation deadline
    pub fn new(
        connector: Arc<dyn Connector>,
        exchange: ExchangeDefinition,
        routing_key: &str,
    ) -> Self {
        AmqpPublisher {
            connector,
            broker: Mutex::new(None),
            exchange,
            routing_key: routing_key.to_owned(),
            timeout: Duration::from_millis(crate::configs::DEFAULT_PUBLISH_TIMEOUT_MS),
            declared: OnceCell::new(),
            connected: AtomicBool::new(false),
        }
    }

    /// Durable direct exchange `exchange`, deadline taken from `cfg`.
    pub fn from_configs(
        connector: Arc<dyn Connector>,
        cfg: &AmqpConfigs,
        exchange: &str,
        routing_key: &str,
    ) -> Self {
        AmqpPublisher::new(
            connector,
            ExchangeDefinition::new(exchange).direct().durable(),
            routing_key,
        )
        .timeout(cfg.publish_timeout())
    }

    /// Sets the deadline covering connect, declare, publish and confirm.
    ///
    /// # Parameters
    /// * `timeout` - The publish deadline
    ///
    /// # Returns
    /// Self for method chaining
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange.name
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Publishes `value` as JSON with the default routing key.
    ///
    /// # Parameters
    /// * `value` - The payload, serialized with serde_json
    ///
    /// # Returns
    /// Ok(()) once confirmed. Serialization errors are returned before any
    /// broker call.
    pub async fn publish<T>(&self, value: &T) -> Result<(), AmqpError>
    where
        T: Serialize + Sync,
    {
        let envelope = Envelope::json(&self.routing_key, value)?;
        self.publish_envelope(&Context::current(), envelope).await
    }

    /// Same as [`publish`](Self::publish) with an explicit routing key.
    pub async fn publish_with_routing_key<T>(
        &self,
        routing_key: &str,
        value: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync,
    {
        let envelope = Envelope::json(routing_key, value)?;
        self.publish_envelope(&Context::current(), envelope).await
    }

    /// Last known connection state.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Closes the broker connection, if any. A later publish reconnects.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.connected.store(false, Ordering::Relaxed);
        let broker = self.broker.lock().await.take();

        match broker {
            Some(broker) => broker.close().await,
            None => Ok(()),
        }
    }

    /// Current broker, reconnecting once if the channel is gone.
    async fn broker(&self) -> Result<Arc<dyn Broker>, AmqpError> {
        let mut slot = self.broker.lock().await;

        if let Some(broker) = slot.as_ref() {
            if broker.is_open() {
                return Ok(broker.clone());
            }
            warn!(exchange = self.exchange.name.as_str(), "publisher channel closed, reconnecting");
        }

        match self.connector.connect().await {
            Ok(broker) => {
                self.connected.store(true, Ordering::Relaxed);
                *slot = Some(broker.clone());
                Ok(broker)
            }
            Err(err) => {
                self.connected.store(false, Ordering::Relaxed);
                *slot = None;
                error!(error = err.to_string(), "publisher failure to connect");
                Err(err)
            }
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), AmqpError> {
        let broker = self.broker().await?;

        if !self.exchange.name.is_empty() {
            self.declared
                .get_or_try_init(|| async { broker.declare_exchange(&self.exchange).await })
                .await?;
        }

        match broker.publish(&self.exchange.name, envelope).await {
            Ok(()) => Ok(()),
            Err(AmqpError::PublishNacked) => Err(AmqpError::PublishNacked),
            Err(err) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish_envelope(
        &self,
        ctx: &Context,
        mut envelope: Envelope,
    ) -> Result<(), AmqpError> {
        otel::inject(ctx, envelope.headers_mut());

        match timeout(self.timeout, self.send(&envelope)).await {
            Ok(Ok(())) => {
                debug!(
                    exchange = self.exchange.name.as_str(),
                    routing_key = envelope.routing_key(),
                    "message published"
                );
                Ok(())
            }
            Ok(Err(err)) => {
                error!(
                    error = err.to_string(),
                    exchange = self.exchange.name.as_str(),
                    routing_key = envelope.routing_key(),
                    "error publishing message"
                );
                Err(err)
            }
            Err(_) => {
                error!(
                    exchange = self.exchange.name.as_str(),
                    routing_key = envelope.routing_key(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "publish deadline exceeded"
                );
                Err(AmqpError::PublishTimeout(self.timeout.as_millis() as u64))
            }
        }
    }
}

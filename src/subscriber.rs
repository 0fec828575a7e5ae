// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Subscriber
//!
//! Consumes one primary queue and hands every delivery to the worker pool.
//!
//! `start` validates and declares the topology, applies QoS and opens the
//! consumer before returning, so a misconfigured stage fails at boot. From
//! then on a single background loop pulls deliveries in order and only
//! spawns workers. When the delivery stream ends the loop marks the
//! subscriber disconnected, backs off, reconnects and declares everything
//! again before resuming.

use crate::{
    broker::{Broker, Connector, DeliveryStream},
    channel::Backoff,
    configs::{AmqpConfigs, DEFAULT_CONCURRENCY, DEFAULT_PREFETCH, MAX_CONCURRENCY},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::Callbacks,
    metrics::{Health, Metrics},
    queue::{QueueBinding, QueueDefinition},
    topology::{build_plan, TopologyPlan},
    worker::{WorkerContext, WorkerPool},
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Connects, declares and opens the consumer. Shared by start and reconnect.
struct Session {
    connector: Arc<dyn Connector>,
    plan: TopologyPlan,
    queue: String,
    prefetch: u16,
    consumer_tag: String,
    metrics: Arc<Metrics>,
}

impl Session {
    async fn open(&self) -> Result<(Arc<dyn Broker>, DeliveryStream), AmqpError> {
        let broker = self.connector.connect().await?;

        match self.prepare(broker.as_ref()).await {
            Ok(stream) => {
                self.metrics.mark_connected();
                info!(
                    queue = self.queue.as_str(),
                    prefetch = self.prefetch,
                    "subscriber connected"
                );
                Ok((broker, stream))
            }
            Err(err) => {
                if let Err(close_err) = broker.close().await {
                    debug!(error = close_err.to_string(), "error closing half-open channel");
                }
                Err(err)
            }
        }
    }

    async fn prepare(&self, broker: &dyn Broker) -> Result<DeliveryStream, AmqpError> {
        self.plan.install(broker).await?;

        if self.prefetch > 0 {
            broker.qos(self.prefetch).await?;
        }

        broker.consume(&self.queue, &self.consumer_tag).await
    }
}

/// Consumer of one primary queue.
pub struct AmqpSubscriber {
    connector: Arc<dyn Connector>,
    exchange: ExchangeDefinition,
    queue: QueueDefinition,
    prefetch: u16,
    concurrency: usize,
    backoff: Backoff,
    metrics: Arc<Metrics>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpSubscriber {
    pub fn new(
        connector: Arc<dyn Connector>,
        exchange: ExchangeDefinition,
        queue: QueueDefinition,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);

        AmqpSubscriber {
            connector,
            exchange,
            queue,
            prefetch: DEFAULT_PREFETCH,
            concurrency: DEFAULT_CONCURRENCY,
            backoff: Backoff::default(),
            metrics,
            started: AtomicBool::new(false),
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// Subscriber for `queue` on the durable direct exchange `exchange`, with
    /// the dead-letter and retry policies taken from `cfg`.
    pub fn from_configs(
        connector: Arc<dyn Connector>,
        cfg: &AmqpConfigs,
        exchange: &str,
        queue: &str,
        metrics: Arc<Metrics>,
    ) -> Self {
        let queue_def = QueueDefinition::new(queue)
            .durable()
            .with_dlq(&cfg.pipeline.dead_letter_exchange)
            .with_retry(
                &cfg.retry_exchange(queue),
                cfg.retry_delay(),
                cfg.pipeline.max_retries,
            );

        AmqpSubscriber::new(
            connector,
            ExchangeDefinition::new(exchange).direct().durable(),
            queue_def,
            metrics,
        )
        .prefetch(cfg.pipeline.prefetch)
        .concurrency(cfg.effective_concurrency())
    }

    /// Channel prefetch window. `0` leaves the broker unbounded.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Number of concurrent workers, kept within `1..=MAX_CONCURRENCY`.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
        self
    }

    /// Delays between reconnect attempts.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange.name
    }

    pub fn queue(&self) -> &str {
        &self.queue.name
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_connected(&self) -> bool {
        self.metrics.is_connected()
    }

    pub fn last_connect_at(&self) -> Option<DateTime<Utc>> {
        self.metrics.last_connect_at()
    }

    pub fn last_delivery_at(&self) -> Option<DateTime<Utc>> {
        self.metrics.last_delivery_at()
    }

    pub fn last_error(&self) -> Option<String> {
        self.metrics.last_error()
    }

    pub fn health(&self) -> Health {
        self.metrics.health()
    }

    /// Declares the topology, binds one routing key per callback and starts
    /// consuming in the background.
    ///
    /// Returns once the consumer is open. Can be called once per subscriber.
    pub async fn start(&self, callbacks: Callbacks) -> Result<(), AmqpError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyStarted);
        }

        match self.launch(callbacks).await {
            Ok(handle) => {
                *self.handle.lock().await = Some(handle);
                Ok(())
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.queue.name.as_str(),
                    "failure to start subscriber"
                );
                self.metrics.mark_disconnected(Some(&err));
                self.started.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn launch(&self, callbacks: Callbacks) -> Result<JoinHandle<()>, AmqpError> {
        let mut keys: Vec<&String> = callbacks.keys().collect();
        keys.sort();

        let bindings: Vec<QueueBinding> = keys
            .into_iter()
            .map(|key| {
                QueueBinding::new(&self.queue.name)
                    .exchange(&self.exchange.name)
                    .routing_key(key)
            })
            .collect();

        let plan = build_plan(&[self.exchange.clone()], &[self.queue.clone()], &bindings)?;

        let session = Session {
            connector: self.connector.clone(),
            plan,
            queue: self.queue.name.clone(),
            prefetch: self.prefetch,
            consumer_tag: format!("{}-{}", self.queue.name, Uuid::new_v4()),
            metrics: self.metrics.clone(),
        };

        let (broker, stream) = session.open().await?;

        let concurrency = match self.prefetch {
            0 => self.concurrency,
            prefetch => self.concurrency.min(prefetch as usize),
        };

        let ctx = WorkerContext::new(
            &self.exchange.name,
            &self.queue.name,
            callbacks,
            self.queue.retry().cloned(),
            self.queue.dead_letter().is_some(),
            self.metrics.clone(),
        );
        let pool = WorkerPool::new(concurrency, Arc::new(ctx));

        info!(
            exchange = self.exchange.name.as_str(),
            queue = self.queue.name.as_str(),
            concurrency,
            "subscriber started"
        );

        Ok(tokio::spawn(run(
            session,
            broker,
            stream,
            pool,
            self.backoff.clone(),
            self.shutdown.subscribe(),
        )))
    }

    /// Stops consuming, waits for in-flight deliveries and closes the channel.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown.send_replace(true);

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = err.to_string(), "subscriber loop ended abnormally");
                return Err(AmqpError::InternalError);
            }
        }

        self.metrics.mark_disconnected(None);
        Ok(())
    }
}

/// Dispatch loop. Owns the current channel until shutdown.
async fn run(
    session: Session,
    mut broker: Arc<dyn Broker>,
    mut stream: DeliveryStream,
    pool: WorkerPool,
    mut backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let failure = tokio::select! {
            _ = shutdown.changed() => break,
            next = stream.next() => {
                match next {
                    Some(Ok(msg)) => {
                        pool.dispatch(broker.clone(), msg).await;
                        continue;
                    }
                    Some(Err(err)) => err,
                    None => AmqpError::ConsumerError("delivery stream closed".to_owned()),
                }
            }
        };

        warn!(
            error = failure.to_string(),
            queue = session.queue.as_str(),
            "subscriber disconnected"
        );
        session.metrics.mark_disconnected(Some(&failure));
        if let Err(err) = broker.close().await {
            debug!(error = err.to_string(), "error closing broken channel");
        }

        match reconnect(&session, &mut backoff, &mut shutdown).await {
            Some((b, s)) => {
                broker = b;
                stream = s;
            }
            None => break,
        }
    }

    debug!(queue = session.queue.as_str(), "draining workers");
    pool.close().await;

    if let Err(err) = broker.close().await {
        warn!(error = err.to_string(), "error closing subscriber channel");
    }
    session.metrics.mark_disconnected(None);
    info!(queue = session.queue.as_str(), "subscriber stopped");
}

/// Retries until connected again or shut down.
async fn reconnect(
    session: &Session,
    backoff: &mut Backoff,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<(Arc<dyn Broker>, DeliveryStream)> {
    loop {
        if *shutdown.borrow() {
            return None;
        }

        let delay = backoff.next_delay();
        info!(
            queue = session.queue.as_str(),
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );

        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match session.open().await {
            Ok(opened) => {
                backoff.reset();
                return Some(opened);
            }
            Err(err) => {
                error!(error = err.to_string(), queue = session.queue.as_str(), "reconnect failed");
                session.metrics.mark_disconnected(Some(&err));
            }
        }
    }
}

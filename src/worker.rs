// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Pool
//!
//! Every admitted delivery runs as its own task and ends in exactly one
//! terminal outcome. Admission waits on a counting semaphore, so a saturated
//! pool simply stops pulling from the broker; the channel prefetch then keeps
//! further messages on the broker side. Nothing is ever dropped to relieve
//! pressure.
//!
//! Per delivery:
//! 1. no handler for the routing key: reject without requeue
//! 2. handler succeeds: ack
//! 3. handler fails or panics: hand over to the retry/dead-letter path
//!
//! Ack, nack and retry-publish failures are counted and logged, and the
//! delivery is left as the broker sees it; no further calls are made for it.

use crate::{
    broker::Broker,
    configs::MAX_CONCURRENCY,
    envelope::Message,
    errors::{AmqpError, HandlerError},
    handler::Callbacks,
    metrics::Metrics,
    otel,
    retry::{decide, RetryDecision, RetryPolicy},
};
use futures_util::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    any::Any,
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Terminal state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingOutcome {
    /// Handler succeeded and the delivery was acked.
    Acked,
    /// Handler failed; a copy went to the retry exchange.
    RetriedTransient,
    /// Rejected without requeue into a queue with a dead-letter policy.
    DeadLettered,
    /// Rejected without requeue and dropped by the broker.
    PermanentReject,
}

impl ProcessingOutcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            ProcessingOutcome::Acked => "acked",
            ProcessingOutcome::RetriedTransient => "retried",
            ProcessingOutcome::DeadLettered => "dead_lettered",
            ProcessingOutcome::PermanentReject => "rejected",
        }
    }
}

/// Everything a worker needs to settle deliveries of one queue.
pub struct WorkerContext {
    pub(crate) exchange: String,
    pub(crate) queue: String,
    pub(crate) callbacks: Callbacks,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) dead_letter: bool,
    pub(crate) metrics: Arc<Metrics>,
}

impl WorkerContext {
    pub fn new(
        exchange: &str,
        queue: &str,
        callbacks: Callbacks,
        retry: Option<RetryPolicy>,
        dead_letter: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        WorkerContext {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            callbacks,
            retry,
            dead_letter,
            metrics,
        }
    }

    fn rejected_outcome(&self) -> ProcessingOutcome {
        if self.dead_letter {
            ProcessingOutcome::DeadLettered
        } else {
            ProcessingOutcome::PermanentReject
        }
    }
}

/// Bounded pool of delivery tasks.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    next_id: AtomicUsize,
    ctx: Arc<WorkerContext>,
}

impl WorkerPool {
    /// Pool of `size` slots, kept within `1..=MAX_CONCURRENCY`.
    pub fn new(size: usize, ctx: Arc<WorkerContext>) -> Self {
        let size = size.clamp(1, MAX_CONCURRENCY);
        WorkerPool {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            next_id: AtomicUsize::new(0),
            ctx,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a free slot, then processes `msg` on its own task.
    ///
    /// Returns once the delivery is admitted, not once it is settled. The
    /// slot is released when the task ends, whatever the outcome.
    pub async fn dispatch(&self, broker: Arc<dyn Broker>, msg: Message) {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // closed pool: leave the delivery unacked so the broker redelivers it
                warn!(
                    delivery_tag = msg.delivery_tag,
                    "worker pool closed, delivery not admitted"
                );
                return;
            }
        };

        let in_flight = InFlight::enter(self.ctx.metrics.clone());
        let worker_id = self.next_id.fetch_add(1, Ordering::Relaxed) % self.size + 1;
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let _in_flight = in_flight;
            process(&ctx, broker.as_ref(), msg, worker_id).await;
        });
    }

    /// Stops admitting deliveries and waits for the in-flight ones to settle.
    pub async fn close(&self) {
        match u32::try_from(self.size) {
            Ok(size) => {
                if let Ok(permits) = self.semaphore.acquire_many(size).await {
                    permits.forget();
                }
            }
            Err(_) => warn!(size = self.size, "pool too large to drain"),
        }
        self.semaphore.close();
    }
}

/// Counts an admitted delivery until dropped, including on unwind.
struct InFlight {
    metrics: Arc<Metrics>,
}

impl InFlight {
    fn enter(metrics: Arc<Metrics>) -> Self {
        metrics.in_flight_inc();
        InFlight { metrics }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.metrics.in_flight_dec();
    }
}

/// Runs one delivery to its terminal outcome.
pub async fn process(
    ctx: &WorkerContext,
    broker: &dyn Broker,
    msg: Message,
    worker_id: usize,
) -> ProcessingOutcome {
    let started_at = Instant::now();
    let metrics = ctx.metrics.as_ref();
    metrics.mark_delivery();

    let delivery_tag = msg.delivery_tag;
    let routing_key = msg.routing_key().to_owned();
    info!(
        worker_id,
        exchange = msg.exchange.as_str(),
        queue = ctx.queue.as_str(),
        routing_key = routing_key.as_str(),
        delivery_tag,
        redelivered = msg.redelivered,
        attempt = msg.attempt(),
        "worker_start"
    );

    let tracer = global::tracer("amqp consumer");
    let (otel_ctx, mut span) = otel::new_span(msg.headers(), &tracer, &routing_key);

    let Some(handler) = ctx.callbacks.get(&routing_key) else {
        let reason = "removing message from queue - reason: no callback for routing key";
        span.set_status(Status::Error {
            description: Cow::from(reason),
        });
        warn!(routing_key = routing_key.as_str(), delivery_tag, "{}", reason);

        let outcome = reject(ctx, broker, delivery_tag).await;
        span.end();
        finish(ctx, outcome, started_at, worker_id, &routing_key, delivery_tag, "nack");
        return outcome;
    };

    let result = AssertUnwindSafe(handler.exec(&otel_ctx, &msg))
        .catch_unwind()
        .await;

    let outcome = match result {
        Ok(Ok(())) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
            match broker.ack(delivery_tag).await {
                Ok(()) => {}
                Err(err) => {
                    metrics.ack_error();
                    error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                    span.record_error(&err);
                }
            }
            ProcessingOutcome::Acked
        }
        Ok(Err(err)) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
            warn!(
                error = err.to_string(),
                routing_key = routing_key.as_str(),
                delivery_tag,
                "error whiling handling msg"
            );
            settle_failure(ctx, broker, msg, &err).await
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            span.set_status(Status::Error {
                description: Cow::from(format!("handler panicked: {}", reason)),
            });
            error!(
                panic = reason.as_str(),
                routing_key = routing_key.as_str(),
                delivery_tag,
                "handler panicked, rejecting msg"
            );
            reject(ctx, broker, delivery_tag).await
        }
    };

    span.end();
    let action = match outcome {
        ProcessingOutcome::Acked => "ack",
        ProcessingOutcome::RetriedTransient => "retry",
        _ => "nack",
    };
    finish(ctx, outcome, started_at, worker_id, &routing_key, delivery_tag, action);
    outcome
}

/// Applies the retry policy to a failed delivery.
async fn settle_failure(
    ctx: &WorkerContext,
    broker: &dyn Broker,
    msg: Message,
    err: &HandlerError,
) -> ProcessingOutcome {
    let delivery_tag = msg.delivery_tag;
    let attempt = msg.attempt();

    match decide(ctx.retry.as_ref(), attempt, err) {
        RetryDecision::Retry { next_attempt } => {
            let Some(policy) = ctx.retry.as_ref() else {
                return reject(ctx, broker, delivery_tag).await;
            };
            let retried = msg.envelope.with_attempt(next_attempt);

            // publish first: acking before the copy is safe would lose the message
            match broker.publish(&policy.exchange, &retried).await {
                Ok(()) => {
                    debug!(
                        retry_exchange = policy.exchange.as_str(),
                        next_attempt, "message sent to retry"
                    );
                    if let Err(err) = broker.ack(delivery_tag).await {
                        ctx.metrics.ack_error();
                        error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                    }
                }
                Err(err) => {
                    ctx.metrics.retry_publish_error();
                    let failure = AmqpError::PublishingToRetryError(policy.exchange.clone());
                    error!(
                        error = failure.to_string(),
                        cause = err.to_string(),
                        delivery_tag,
                        "requeuing message"
                    );
                    if let Err(err) = broker.nack(delivery_tag, true).await {
                        ctx.metrics.nack_error();
                        error!(error = err.to_string(), delivery_tag, "error whiling requeuing");
                    }
                }
            }

            ProcessingOutcome::RetriedTransient
        }
        RetryDecision::Exhausted => {
            error!(
                attempt,
                queue = ctx.queue.as_str(),
                "too many attempts, sending to dlq"
            );
            reject(ctx, broker, delivery_tag).await
        }
        RetryDecision::Reject => {
            warn!(
                error = err.to_string(),
                queue = ctx.queue.as_str(),
                "permanent failure, sending to dlq"
            );
            reject(ctx, broker, delivery_tag).await
        }
    }
}

/// Rejects without requeue; the broker dead-letters it if the queue has a DLX.
async fn reject(ctx: &WorkerContext, broker: &dyn Broker, delivery_tag: u64) -> ProcessingOutcome {
    if let Err(err) = broker.nack(delivery_tag, false).await {
        ctx.metrics.nack_error();
        error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
    }
    ctx.rejected_outcome()
}

fn finish(
    ctx: &WorkerContext,
    outcome: ProcessingOutcome,
    started_at: Instant,
    worker_id: usize,
    routing_key: &str,
    delivery_tag: u64,
    action: &str,
) {
    let elapsed: Duration = started_at.elapsed();
    ctx.metrics.observe(outcome, elapsed);
    info!(
        worker_id,
        exchange = ctx.exchange.as_str(),
        queue = ctx.queue.as_str(),
        routing_key,
        delivery_tag,
        duration_ms = elapsed.as_millis() as u64,
        action,
        outcome = outcome.as_label(),
        "worker_finish"
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return (*s).to_owned();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_owned()
}

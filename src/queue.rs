// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! Types for defining queues and their bindings. A primary queue carries its
//! retry and dead-letter policies; the topology expands them into the retry
//! exchange, the TTL queue, the dead-letter exchange and the dead-letter queue.

use crate::retry::{DeadLetterPolicy, RetryPolicy};
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use std::collections::BTreeMap;
use std::time::Duration;

/// Header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Queues are never exclusive in this pipeline so several consumer instances
/// can share the load. A primary queue must either carry a dead-letter policy
/// ([`with_dlq`](Self::with_dlq)) or be marked
/// [`discard_rejected`](Self::discard_rejected); the topology refuses anything
/// else.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<Duration>,
    pub(crate) max_length: Option<i64>,
    pub(crate) max_length_bytes: Option<i64>,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
    pub(crate) dead_letter: Option<DeadLetterPolicy>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) discard_rejected: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A non-durable, non-exclusive queue definition without arguments
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Marks the queue as durable, so it survives broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue once its last consumer goes away.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Restricts the queue to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the per-message TTL of the queue (`x-message-ttl`).
    ///
    /// # Parameters
    /// * `ttl` - How long a message may stay in the queue
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Caps the number of ready messages (`x-max-length`).
    ///
    /// # Parameters
    /// * `max` - Maximum number of messages
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length(mut self, max: i64) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_length_bytes(mut self, max_bytes: i64) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a raw declaration argument.
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Sends rejected messages to `<name>.dlq` through `exchange`.
    ///
    /// # Parameters
    /// * `exchange` - The dead-letter exchange, shared by every queue
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_dlq(mut self, exchange: &str) -> Self {
        self.dead_letter = Some(DeadLetterPolicy::new(exchange, &self.name));
        self.discard_rejected = false;
        self
    }

    /// Redelivers failed messages through `<name>.retry` after `delay`, at
    /// most `retries` times, using the retry exchange `exchange`.
    ///
    /// # Parameters
    /// * `exchange` - The retry exchange owned by this queue
    /// * `delay` - TTL of the `<name>.retry` queue
    /// * `retries` - Retry budget before the message is dead-lettered
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_retry(mut self, exchange: &str, delay: Duration, retries: u32) -> Self {
        self.retry = Some(RetryPolicy::new(exchange, delay, retries));
        self
    }

    /// Accepts that messages rejected without requeue are dropped.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn discard_rejected(mut self) -> Self {
        self.discard_rejected = true;
        self.dead_letter = None;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn is_no_wait(&self) -> bool {
        self.no_wait
    }

    pub fn dead_letter(&self) -> Option<&DeadLetterPolicy> {
        self.dead_letter.as_ref()
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn discards_rejected(&self) -> bool {
        self.discard_rejected
    }

    /// Declaration arguments as sent to the broker, including the
    /// dead-letter arguments derived from the policy.
    pub fn arguments(&self) -> FieldTable {
        let mut args = self.params.clone();

        if let Some(dl) = &self.dead_letter {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(dl.exchange.clone())),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(dl.queue.clone())),
            );
        }

        if let Some(ttl) = self.ttl {
            let ms = LongLongInt::try_from(ttl.as_millis()).unwrap_or(LongLongInt::MAX);
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongLongInt(ms),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongLongInt(max),
            );
        }

        if let Some(max) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongLongInt(max),
            );
        }

        FieldTable::from(args)
    }

    /// Whether declaring `other` after `self` would be accepted by the broker.
    pub fn is_equivalent(&self, other: &QueueDefinition) -> bool {
        self.name == other.name
            && self.durable == other.durable
            && self.exclusive == other.exclusive
            && self.delete == other.delete
            && self.arguments() == other.arguments()
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for `queue`; exchange and key default to empty.
    ///
    /// # Parameters
    /// * `queue` - The queue to bind
    ///
    /// # Returns
    /// A new binding definition
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange to bind to.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key (or pattern, on topic exchanges).
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
        table.inner().get(key)
    }

    #[test]
    fn test_primary_queue_arguments() {
        let def = QueueDefinition::new("reports")
            .durable()
            .with_dlq("pipeline-dlx")
            .with_retry("retry.reports", Duration::from_secs(5), 3);

        let args = def.arguments();
        assert_eq!(
            arg(&args, AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("pipeline-dlx")))
        );
        assert_eq!(
            arg(&args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("reports.dlq")))
        );
        assert!(arg(&args, AMQP_HEADERS_MESSAGE_TTL).is_none());
        assert_eq!(def.retry().map(|r| r.max_retries()), Some(3));
        assert!(!def.is_exclusive());
    }

    #[test]
    fn test_ttl_and_limits() {
        let args = QueueDefinition::new("reports.retry")
            .ttl(Duration::from_millis(1500))
            .max_length(10)
            .arguments();

        assert_eq!(
            arg(&args, AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongLongInt(1500))
        );
        assert_eq!(
            arg(&args, AMQP_HEADERS_MAX_LENGTH),
            Some(&AMQPValue::LongLongInt(10))
        );
    }

    #[test]
    fn test_discard_rejected_clears_dead_letter_policy() {
        let def = QueueDefinition::new("reports")
            .with_dlq("pipeline-dlx")
            .discard_rejected();

        assert!(def.discards_rejected());
        assert!(def.dead_letter().is_none());
        assert!(def.arguments().inner().is_empty());
    }

    #[test]
    fn test_equivalence() {
        let a = QueueDefinition::new("reports").durable().with_dlq("dlx");
        let b = QueueDefinition::new("reports").durable().with_dlq("dlx");
        let c = QueueDefinition::new("reports").durable().with_dlq("other-dlx");

        assert!(a.is_equivalent(&b));
        assert!(!a.is_equivalent(&c));
    }

    #[test]
    fn test_binding_builder() {
        let binding = QueueBinding::new("reports")
            .exchange("events")
            .routing_key("report.raw");

        assert_eq!(binding.queue_name(), "reports");
        assert_eq!(binding.exchange_name(), "events");
        assert_eq!(binding.key(), "report.raw");
    }
}

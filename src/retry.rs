// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry and Dead-Letter Policies
//!
//! A failed delivery either goes around the delay loop again or is rejected
//! into the dead-letter path. The delay loop is plain broker topology: the
//! worker acks the original delivery and republishes a copy, with its
//! `attempt` header incremented, to the queue's retry exchange. The retry
//! queue holds it for `delay` (message TTL) and then dead-letters it back to
//! the main exchange under its original routing key.
//!
//! Transient errors are retried while `attempt < max_retries`. Permanent
//! errors, and transient errors past the ceiling, are rejected without
//! requeue, which makes the broker move them to the dead-letter queue.

use crate::errors::HandlerError;
use std::time::Duration;

/// Suffix of the TTL queue that holds messages between attempts.
pub const RETRY_QUEUE_SUFFIX: &str = ".retry";
/// Suffix of the quarantine queue.
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = ".dlq";
/// Binding key of the retry queue. Accepts every routing key of its primary queue.
pub const RETRY_BINDING_KEY: &str = "#";

/// Delay path configuration of one primary queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub(crate) exchange: String,
    pub(crate) delay: Duration,
    pub(crate) max_retries: u32,
}

impl RetryPolicy {
    /// * `exchange` - name of the retry exchange (`<prefix><queue>`)
    /// * `delay` - time a message waits in the retry queue
    /// * `max_retries` - attempt ceiling
    pub fn new(exchange: &str, delay: Duration, max_retries: u32) -> Self {
        RetryPolicy {
            exchange: exchange.to_owned(),
            delay,
            max_retries,
        }
    }

    /// Policy named after `queue` with the given exchange prefix.
    pub fn for_queue(prefix: &str, queue: &str, delay: Duration, max_retries: u32) -> Self {
        Self::new(&format!("{}{}", prefix, queue), delay, max_retries)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// TTL of the retry queue in milliseconds, as the broker expects it.
    pub fn delay_ms(&self) -> i64 {
        i64::try_from(self.delay.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Quarantine path configuration of one primary queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    pub(crate) exchange: String,
    pub(crate) queue: String,
}

impl DeadLetterPolicy {
    /// * `exchange` - shared dead-letter exchange
    /// * `queue` - owning primary queue; the dead-letter queue is `<queue>.dlq`
    pub fn new(exchange: &str, queue: &str) -> Self {
        DeadLetterPolicy {
            exchange: exchange.to_owned(),
            queue: dead_letter_queue_name(queue),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Name of the dead-letter queue, also used as its routing key.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

pub fn retry_queue_name(queue: &str) -> String {
    format!("{}{}", queue, RETRY_QUEUE_SUFFIX)
}

pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_QUEUE_SUFFIX)
}

/// What the worker must do with a delivery whose callback failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish to the retry exchange with this attempt number, then ack.
    Retry { next_attempt: u32 },
    /// Retry budget exhausted: reject without requeue.
    Exhausted,
    /// Permanent failure: reject without requeue, skipping the budget.
    Reject,
}

/// Classifies a failed attempt.
///
/// `retry` is `None` for queues declared without a delay path, in which case
/// every failure goes straight to the dead-letter path.
pub fn decide(retry: Option<&RetryPolicy>, attempt: u32, err: &HandlerError) -> RetryDecision {
    if err.is_permanent() {
        return RetryDecision::Reject;
    }

    match retry {
        Some(policy) if attempt < policy.max_retries => RetryDecision::Retry {
            next_attempt: attempt.saturating_add(1),
        },
        Some(_) => RetryDecision::Exhausted,
        None => RetryDecision::Reject,
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Event-delivery backbone for staged pipelines over AMQP 0-9-1.
//!
//! Stages publish JSON envelopes with [`publisher::AmqpPublisher`] and consume
//! them with [`subscriber::AmqpSubscriber`]. Failed deliveries are retried
//! through a per-queue delay queue and dead-lettered once the retry budget is
//! spent.

mod otel;

pub mod broker;
pub mod channel;
pub mod configs;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod metrics;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod subscriber;
pub mod topology;
pub mod worker;

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Pipeline
//!
//! Two families of errors live here. `AmqpError` covers the infrastructure:
//! connecting, declaring topology, publishing, and acknowledging. `HandlerError`
//! is what a stage callback returns to tell the worker how a failure should be
//! treated by the retry and dead-letter path.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection-level failures, declaration failures and serialization failures
/// are distinct variants so callers can tell "my data was malformed" apart from
/// "the broker is unreachable".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// The broker refused or dropped a publish
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker answered a publish with a negative confirm
    #[error("publish was nacked by the broker")]
    PublishNacked,

    /// The publish deadline elapsed before the broker confirmed
    #[error("publish timed out after {0}ms")]
    PublishTimeout(u64),

    /// Error serializing a payload
    #[error("failure to serialize payload `{0}`")]
    SerializationError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a failed message to its retry exchange
    #[error("failure to publish to retry exchange `{0}`")]
    PublishingToRetryError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// A primary queue has neither a dead-letter policy nor an explicit opt-out
    #[error("queue `{0}` has no dead-letter policy")]
    MissingDeadLetterPolicy(String),

    /// A topology definition is inconsistent
    #[error("invalid topology `{0}`")]
    InvalidTopology(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// `start` was called more than once on the same subscriber
    #[error("subscriber already started")]
    AlreadyStarted,

    /// Error registering or encoding metrics
    #[error("metrics error `{0}`")]
    MetricsError(String),
}

/// Failure reported by a stage callback.
///
/// Transient failures go through the retry budget of the queue; permanent
/// failures skip it and are rejected straight into the dead-letter path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient<E: ToString>(err: E) -> Self {
        HandlerError::Transient(err.to_string())
    }

    pub fn permanent<E: ToString>(err: E) -> Self {
        HandlerError::Permanent(err.to_string())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Permanent(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    /// A payload that cannot be decoded will never decode on a later attempt.
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Permanent(err.to_string())
    }
}

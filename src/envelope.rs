// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The unit of transfer between stages. An envelope is created by the
//! publisher, travels unchanged through the broker, and is only rewritten by
//! the retry path, which bumps its `attempt` header before republishing.
//! Its `message_id` and `timestamp` are fixed at creation and survive every
//! retry, so handlers can use the id as an idempotency key.

use crate::errors::AmqpError;
use chrono::Utc;
use lapin::{
    types::{AMQPValue, FieldTable, LongInt, ShortString},
    BasicProperties,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header carrying the number of retry passes a message went through
pub const ATTEMPT_HEADER: &str = "attempt";
/// AMQP delivery mode for messages that survive a broker restart
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
/// AMQP delivery mode for messages kept in memory only
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;

pub type Headers = BTreeMap<ShortString, AMQPValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub(crate) routing_key: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) content_type: String,
    pub(crate) persistent: bool,
    pub(crate) headers: Headers,
    pub(crate) message_id: String,
    pub(crate) timestamp: u64,
}

impl Envelope {
    /// Raw envelope. Persistent, `application/json`, no headers, a fresh
    /// v4 message id and the current time as timestamp.
    pub fn new(routing_key: &str, payload: Vec<u8>) -> Self {
        Envelope {
            routing_key: routing_key.to_owned(),
            payload,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            persistent: true,
            headers: Headers::default(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: u64::try_from(Utc::now().timestamp()).unwrap_or_default(),
        }
    }

    /// Serializes `value` to JSON.
    pub fn json<T>(routing_key: &str, value: &T) -> Result<Self, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(value)
            .map_err(|err| AmqpError::SerializationError(err.to_string()))?;
        Ok(Self::new(routing_key, payload))
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn with_header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(ShortString::from(key), value);
        self
    }

    /// Replaces the generated message id, e.g. with a business key.
    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = message_id.to_owned();
        self
    }

    /// Replaces the creation timestamp (seconds since the Unix epoch).
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub(crate) fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub(crate) fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub(crate) fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Retry passes so far. Missing or unreadable headers count as 0.
    pub fn attempt(&self) -> u32 {
        self.headers
            .get(ATTEMPT_HEADER)
            .map(attempt_from_value)
            .unwrap_or_default()
    }

    /// Copy of this envelope with the `attempt` header set to `attempt`.
    /// Every other header is kept.
    pub fn with_attempt(&self, attempt: u32) -> Self {
        let mut next = self.clone();
        next.headers.insert(
            ShortString::from(ATTEMPT_HEADER),
            AMQPValue::LongInt(LongInt::try_from(attempt).unwrap_or(LongInt::MAX)),
        );
        next
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.payload)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    /// Properties sent along with the payload.
    pub fn properties(&self) -> BasicProperties {
        let delivery_mode = if self.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };

        BasicProperties::default()
            .with_content_type(ShortString::from(self.content_type.clone()))
            .with_delivery_mode(delivery_mode)
            .with_message_id(ShortString::from(self.message_id.clone()))
            .with_timestamp(self.timestamp)
            .with_headers(FieldTable::from(self.headers.clone()))
    }
}

fn attempt_from_value(value: &AMQPValue) -> u32 {
    let n: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::ShortString(v) => v.as_str().trim().parse().unwrap_or_default(),
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or_default(),
        _ => 0,
    };

    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

/// Consumer-side view of an envelope.
///
/// Owned by exactly one worker from the moment it is admitted until it
/// reaches a terminal outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub envelope: Envelope,
}

impl Message {
    pub fn new(delivery_tag: u64, redelivered: bool, exchange: &str, envelope: Envelope) -> Self {
        Message {
            delivery_tag,
            redelivered,
            exchange: exchange.to_owned(),
            envelope,
        }
    }

    pub fn routing_key(&self) -> &str {
        self.envelope.routing_key()
    }

    pub fn payload(&self) -> &[u8] {
        self.envelope.payload()
    }

    pub fn headers(&self) -> &Headers {
        self.envelope.headers()
    }

    pub fn attempt(&self) -> u32 {
        self.envelope.attempt()
    }

    /// Stable across redeliveries and retries.
    pub fn message_id(&self) -> &str {
        self.envelope.message_id()
    }

    /// Seconds since the Unix epoch at which the envelope was first published.
    pub fn timestamp(&self) -> u64 {
        self.envelope.timestamp()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        self.envelope.decode()
    }

    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Stage Callbacks
//!
//! The boundary to a stage's business logic. A handler receives the delivery
//! and returns `Ok(())` to have it acknowledged, or a [`HandlerError`] to send
//! it through the retry and dead-letter path. Delivery is at-least-once, so
//! handlers must be idempotent.

use crate::{envelope::Message, errors::HandlerError};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{collections::HashMap, future::Future, sync::Arc};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &Message) -> Result<(), HandlerError>;
}

/// Handlers keyed by the routing key they serve.
pub type Callbacks = HashMap<String, Arc<dyn ConsumerHandler>>;

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &Message) -> Result<(), HandlerError> {
        (self.f)(msg.clone()).await
    }
}

/// Wraps an async closure into a shareable handler.
///
/// ```
/// use amqp_pipeline::{errors::HandlerError, handler::handler_fn};
///
/// let handler = handler_fn(|msg| async move {
///     let _report: serde_json::Value = msg.decode().map_err(HandlerError::permanent)?;
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

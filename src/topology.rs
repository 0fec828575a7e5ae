// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Turns exchange, queue and binding definitions into the full broker
//! topology of the pipeline. For every primary queue with policies this adds:
//!
//! | Object | Declaration |
//! |---|---|
//! | dead-letter exchange | `direct`, durable, shared by all queues |
//! | dead-letter queue | `<queue>.dlq`, bound to the DLX with key `<queue>.dlq` |
//! | retry exchange | `topic`, durable, `<retry-prefix><queue>` |
//! | retry queue | `<queue>.retry`, `x-message-ttl=<delay-ms>`, `x-dead-letter-exchange=<main exchange>`, bound with `#` |
//!
//! The plan is computed and validated before any broker call, so a primary
//! queue without a dead-letter policy fails startup instead of silently
//! dropping rejected messages later.

use crate::{
    broker::Broker,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, AMQP_HEADERS_DEAD_LETTER_EXCHANGE},
    retry::{retry_queue_name, RETRY_BINDING_KEY},
};
use async_trait::async_trait;
use lapin::types::{AMQPValue, LongString};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, error};

/// Interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a primary queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares every exchange, queue and binding on the broker.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Ordered, validated list of declarations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyPlan {
    pub exchanges: Vec<ExchangeDefinition>,
    pub queues: Vec<QueueDefinition>,
    pub bindings: Vec<QueueBinding>,
}

impl TopologyPlan {
    pub fn exchange(&self, name: &str) -> Option<&ExchangeDefinition> {
        self.exchanges.iter().find(|e| e.name == name)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn bindings_of(&self, queue: &str) -> Vec<&QueueBinding> {
        self.bindings
            .iter()
            .filter(|b| b.queue_name == queue)
            .collect()
    }

    /// Declares exchanges, then queues, then bindings.
    pub async fn install(&self, broker: &dyn Broker) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            broker.declare_exchange(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        for queue in &self.queues {
            broker.declare_queue(queue).await?;
            debug!("queue: {} was created", queue.name);
        }

        for binding in &self.bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            broker.bind_queue(binding).await?;
        }

        Ok(())
    }

    fn push_exchange(&mut self, def: ExchangeDefinition) -> Result<(), AmqpError> {
        match self.exchange(&def.name) {
            Some(existing) if existing.is_equivalent(&def) => Ok(()),
            Some(_) => Err(AmqpError::InvalidTopology(format!(
                "exchange `{}` is defined twice with different parameters",
                def.name
            ))),
            None => {
                self.exchanges.push(def);
                Ok(())
            }
        }
    }

    fn push_queue(&mut self, def: QueueDefinition) -> Result<(), AmqpError> {
        match self.queue(&def.name) {
            Some(existing) if existing.is_equivalent(&def) => Ok(()),
            Some(_) => Err(AmqpError::InvalidTopology(format!(
                "queue `{}` is defined twice with different parameters",
                def.name
            ))),
            None => {
                self.queues.push(def);
                Ok(())
            }
        }
    }

    fn push_binding(&mut self, binding: QueueBinding) {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    broker: Arc<dyn Broker>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    pub fn new(broker: Arc<dyn Broker>) -> AmqpTopology {
        AmqpTopology {
            broker,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }

    /// Validates the definitions and expands them into every declaration
    /// the broker needs.
    pub fn plan(&self) -> Result<TopologyPlan, AmqpError> {
        build_plan(&self.exchanges, &self.queues, &self.queues_binding)
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        let plan = self.plan().map_err(|err| {
            error!(error = err.to_string(), "invalid topology");
            err
        })?;
        plan.install(self.broker.as_ref()).await
    }
}

/// Expands primary definitions into a full plan.
pub fn build_plan(
    exchanges: &[ExchangeDefinition],
    queues: &[QueueDefinition],
    bindings: &[QueueBinding],
) -> Result<TopologyPlan, AmqpError> {
    let mut plan = TopologyPlan::default();

    for exch in exchanges {
        plan.push_exchange(exch.clone())?;
    }

    for binding in bindings {
        if plan.exchange(&binding.exchange_name).is_none() {
            return Err(AmqpError::InvalidTopology(format!(
                "binding of `{}` refers to undeclared exchange `{}`",
                binding.queue_name, binding.exchange_name
            )));
        }
        if !queues.iter().any(|q| q.name == binding.queue_name) {
            return Err(AmqpError::InvalidTopology(format!(
                "binding refers to undeclared queue `{}`",
                binding.queue_name
            )));
        }
    }

    for queue in queues {
        validate_queue(queue)?;

        if let Some(dl) = &queue.dead_letter {
            plan.push_exchange(ExchangeDefinition::new(&dl.exchange).direct().durable())?;
        }

        if let Some(retry) = &queue.retry {
            let sources: BTreeSet<&str> = bindings
                .iter()
                .filter(|b| b.queue_name == queue.name)
                .map(|b| b.exchange_name.as_str())
                .collect();

            let main_exchange = match sources.len() {
                1 => sources.into_iter().next().unwrap_or_default(),
                0 => {
                    return Err(AmqpError::InvalidTopology(format!(
                        "queue `{}` has a retry policy but no binding",
                        queue.name
                    )))
                }
                _ => {
                    return Err(AmqpError::InvalidTopology(format!(
                        "queue `{}` has a retry policy but is bound to several exchanges",
                        queue.name
                    )))
                }
            };

            let retry_queue = retry_queue_name(&queue.name);
            plan.push_exchange(ExchangeDefinition::new(&retry.exchange).topic().durable())?;
            plan.push_queue(
                QueueDefinition::new(&retry_queue)
                    .durable()
                    .ttl(retry.delay)
                    .param(
                        AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
                        AMQPValue::LongString(LongString::from(main_exchange)),
                    ),
            )?;
            plan.push_binding(
                QueueBinding::new(&retry_queue)
                    .exchange(&retry.exchange)
                    .routing_key(RETRY_BINDING_KEY),
            );
        }

        if let Some(dl) = &queue.dead_letter {
            plan.push_queue(QueueDefinition::new(&dl.queue).durable())?;
            plan.push_binding(
                QueueBinding::new(&dl.queue)
                    .exchange(&dl.exchange)
                    .routing_key(&dl.queue),
            );
        }

        plan.push_queue(queue.clone())?;
    }

    for binding in bindings {
        plan.push_binding(binding.clone());
    }

    Ok(plan)
}

fn validate_queue(queue: &QueueDefinition) -> Result<(), AmqpError> {
    if queue.name.is_empty() {
        return Err(AmqpError::InvalidTopology(
            "primary queues must be named".to_owned(),
        ));
    }

    if queue.exclusive {
        return Err(AmqpError::InvalidTopology(format!(
            "queue `{}` must not be exclusive",
            queue.name
        )));
    }

    if queue.dead_letter.is_none() && !queue.discard_rejected {
        return Err(AmqpError::MissingDeadLetterPolicy(queue.name.clone()));
    }

    if let Some(retry) = &queue.retry {
        if retry.delay.is_zero() {
            return Err(AmqpError::InvalidTopology(format!(
                "queue `{}` has a zero retry delay",
                queue.name
            )));
        }
        if retry.exchange.is_empty() {
            return Err(AmqpError::InvalidTopology(format!(
                "queue `{}` has an unnamed retry exchange",
                queue.name
            )));
        }
    }

    Ok(())
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels, and the
//! backoff used between reconnect attempts.

use crate::{
    broker::{Broker, Connector, LapinBroker},
    configs::AmqpConfigs,
    errors::AmqpError,
};
use async_trait::async_trait;
use lapin::{
    options::ConfirmSelectOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, error};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Creates a new AMQP connection and a channel with publisher confirms on.
///
/// The whole handshake is bounded by the configured publish deadline so a
/// black-holed broker fails fast instead of hanging the caller.
///
/// # Example
/// ```no_run
/// # async fn run() -> Result<(), amqp_pipeline::errors::AmqpError> {
/// use amqp_pipeline::{channel::new_amqp_channel, configs::AmqpConfigs};
///
/// let (conn, channel) = new_amqp_channel(&AmqpConfigs::from_env()).await?;
/// # Ok(())
/// # }
/// ```
pub async fn new_amqp_channel(
    cfg: &AmqpConfigs,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match timeout(
        cfg.publish_timeout(),
        Connection::connect(&cfg.amqp_uri(), options),
    )
    .await
    {
        Ok(Ok(c)) => Ok(c),
        Ok(Err(err)) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
        Err(_) => {
            error!("timeout while connecting");
            Err(AmqpError::ConnectionError("connect timeout".to_owned()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }?;

    if let Err(err) = channel
        .confirm_select(ConfirmSelectOptions { nowait: false })
        .await
    {
        error!(error = err.to_string(), "error to enable publisher confirms");
        return Err(AmqpError::ChannelError(err.to_string()));
    }
    debug!("channel created");

    Ok((Arc::new(conn), Arc::new(channel)))
}

/// [`Connector`] that opens a new lapin connection per call.
pub struct AmqpConnector {
    cfg: AmqpConfigs,
}

impl AmqpConnector {
    pub fn new(cfg: AmqpConfigs) -> Arc<AmqpConnector> {
        Arc::new(AmqpConnector { cfg })
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, AmqpError> {
        let (conn, channel) = new_amqp_channel(&self.cfg).await?;
        Ok(Arc::new(LapinBroker::new(conn, channel)))
    }
}

/// Exponential delay between reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

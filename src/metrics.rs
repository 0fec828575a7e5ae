// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Health and Metrics
//!
//! Prometheus metrics for one consuming stage plus the best-effort health
//! signals exposed by the subscriber. Every instance owns its own
//! [`Registry`], so several stages can live in one process.

use crate::{errors::AmqpError, worker::ProcessingOutcome};
use chrono::{DateTime, TimeZone, Utc};
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        RwLock,
    },
    time::Duration,
};

/// Histogram buckets of the processing duration, in seconds.
pub const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 60.0, 120.0, 300.0,
];

pub const DEFAULT_NAMESPACE: &str = "pipeline";

/// Point-in-time health snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Health {
    pub connected: bool,
    pub last_connect_at: Option<DateTime<Utc>>,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub in_flight: i64,
    pub last_error: Option<String>,
}

pub struct Metrics {
    registry: Registry,
    connected: IntGauge,
    last_connect_seconds: Gauge,
    last_delivery_seconds: Gauge,
    in_flight: IntGauge,
    processed_total: IntCounterVec,
    processing_duration_seconds: HistogramVec,
    ack_error_total: IntCounter,
    nack_error_total: IntCounter,
    retry_publish_error_total: IntCounter,

    is_connected: AtomicBool,
    last_connect_ms: AtomicI64,
    last_delivery_ms: AtomicI64,
    last_error: RwLock<Option<String>>,
}

impl Metrics {
    /// Registers every metric under `namespace` and `subsystem`
    /// (either may be empty).
    pub fn new(namespace: &str, subsystem: &str) -> Result<Self, AmqpError> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(namespace)
                .subsystem(subsystem)
        };

        let connected = IntGauge::with_opts(opts(
            "rabbitmq_connected",
            "Whether the RabbitMQ subscriber is currently connected (best-effort).",
        ))
        .map_err(metrics_err)?;
        let last_connect_seconds = Gauge::with_opts(opts(
            "rabbitmq_last_connect_timestamp_seconds",
            "Unix timestamp (seconds) of the last successful RabbitMQ connect.",
        ))
        .map_err(metrics_err)?;
        let last_delivery_seconds = Gauge::with_opts(opts(
            "rabbitmq_last_delivery_timestamp_seconds",
            "Unix timestamp (seconds) of the last RabbitMQ delivery observed.",
        ))
        .map_err(metrics_err)?;
        let in_flight = IntGauge::with_opts(opts(
            "rabbitmq_worker_in_flight",
            "Current number of RabbitMQ deliveries being processed by workers.",
        ))
        .map_err(metrics_err)?;
        let processed_total = IntCounterVec::new(
            opts(
                "rabbitmq_processed_total",
                "Total number of RabbitMQ deliveries processed, labeled by result.",
            ),
            &["result"],
        )
        .map_err(metrics_err)?;
        let processing_duration_seconds = HistogramVec::new(
            HistogramOpts::from(opts(
                "rabbitmq_processing_duration_seconds",
                "End-to-end time to process a RabbitMQ delivery (callback + ack/nack).",
            ))
            .buckets(DURATION_BUCKETS.to_vec()),
            &["result"],
        )
        .map_err(metrics_err)?;
        let ack_error_total = IntCounter::with_opts(opts(
            "rabbitmq_ack_error_total",
            "Total number of RabbitMQ ack errors.",
        ))
        .map_err(metrics_err)?;
        let nack_error_total = IntCounter::with_opts(opts(
            "rabbitmq_nack_error_total",
            "Total number of RabbitMQ nack errors.",
        ))
        .map_err(metrics_err)?;
        let retry_publish_error_total = IntCounter::with_opts(opts(
            "rabbitmq_retry_publish_error_total",
            "Total number of retry-exchange publish errors.",
        ))
        .map_err(metrics_err)?;

        registry.register(Box::new(connected.clone())).map_err(metrics_err)?;
        registry.register(Box::new(last_connect_seconds.clone())).map_err(metrics_err)?;
        registry.register(Box::new(last_delivery_seconds.clone())).map_err(metrics_err)?;
        registry.register(Box::new(in_flight.clone())).map_err(metrics_err)?;
        registry.register(Box::new(processed_total.clone())).map_err(metrics_err)?;
        registry
            .register(Box::new(processing_duration_seconds.clone()))
            .map_err(metrics_err)?;
        registry.register(Box::new(ack_error_total.clone())).map_err(metrics_err)?;
        registry.register(Box::new(nack_error_total.clone())).map_err(metrics_err)?;
        registry
            .register(Box::new(retry_publish_error_total.clone()))
            .map_err(metrics_err)?;

        Ok(Metrics {
            registry,
            connected,
            last_connect_seconds,
            last_delivery_seconds,
            in_flight,
            processed_total,
            processing_duration_seconds,
            ack_error_total,
            nack_error_total,
            retry_publish_error_total,
            is_connected: AtomicBool::new(false),
            last_connect_ms: AtomicI64::new(0),
            last_delivery_ms: AtomicI64::new(0),
            last_error: RwLock::new(None),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String, AmqpError> {
        let mut buffer = vec![];
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_err)?;
        String::from_utf8(buffer).map_err(metrics_err)
    }

    pub(crate) fn mark_connected(&self) {
        let now = Utc::now();
        self.is_connected.store(true, Ordering::SeqCst);
        self.connected.set(1);
        self.last_connect_ms.store(now.timestamp_millis(), Ordering::SeqCst);
        self.last_connect_seconds.set(now.timestamp() as f64);
        self.set_last_error(None);
    }

    pub(crate) fn mark_disconnected(&self, err: Option<&AmqpError>) {
        self.is_connected.store(false, Ordering::SeqCst);
        self.connected.set(0);
        if let Some(err) = err {
            self.set_last_error(Some(err.to_string()));
        }
    }

    pub(crate) fn mark_delivery(&self) {
        let now = Utc::now();
        self.last_delivery_ms.store(now.timestamp_millis(), Ordering::SeqCst);
        self.last_delivery_seconds.set(now.timestamp() as f64);
    }

    pub(crate) fn in_flight_inc(&self) {
        self.in_flight.inc();
    }

    pub(crate) fn in_flight_dec(&self) {
        self.in_flight.dec();
    }

    pub(crate) fn observe(&self, outcome: ProcessingOutcome, elapsed: Duration) {
        let label = outcome.as_label();
        self.processed_total.with_label_values(&[label]).inc();
        self.processing_duration_seconds
            .with_label_values(&[label])
            .observe(elapsed.as_secs_f64());
    }

    pub(crate) fn ack_error(&self) {
        self.ack_error_total.inc();
    }

    pub(crate) fn nack_error(&self) {
        self.nack_error_total.inc();
    }

    pub(crate) fn retry_publish_error(&self) {
        self.retry_publish_error_total.inc();
    }

    fn set_last_error(&self, err: Option<String>) {
        if let Ok(mut last) = self.last_error.write() {
            *last = err;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.get()
    }

    pub fn processed(&self, outcome: ProcessingOutcome) -> u64 {
        self.processed_total
            .with_label_values(&[outcome.as_label()])
            .get()
    }

    /// Number of latency samples recorded for `outcome`.
    pub fn duration_samples(&self, outcome: ProcessingOutcome) -> u64 {
        self.processing_duration_seconds
            .with_label_values(&[outcome.as_label()])
            .get_sample_count()
    }

    pub fn ack_errors(&self) -> u64 {
        self.ack_error_total.get()
    }

    pub fn nack_errors(&self) -> u64 {
        self.nack_error_total.get()
    }

    pub fn retry_publish_errors(&self) -> u64 {
        self.retry_publish_error_total.get()
    }

    pub fn last_connect_at(&self) -> Option<DateTime<Utc>> {
        from_millis(self.last_connect_ms.load(Ordering::SeqCst))
    }

    pub fn last_delivery_at(&self) -> Option<DateTime<Utc>> {
        from_millis(self.last_delivery_ms.load(Ordering::SeqCst))
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().ok().and_then(|last| last.clone())
    }

    pub fn health(&self) -> Health {
        Health {
            connected: self.is_connected(),
            last_connect_at: self.last_connect_at(),
            last_delivery_at: self.last_delivery_at(),
            in_flight: self.in_flight(),
            last_error: self.last_error(),
        }
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

fn metrics_err<E: ToString>(err: E) -> AmqpError {
    AmqpError::MetricsError(err.to_string())
}

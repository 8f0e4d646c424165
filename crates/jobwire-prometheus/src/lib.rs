//! Prometheus metrics for the jobwire updater.
//!
//! [`PrometheusMetrics`] is a [`Subscribe`](jobwire_core::Subscribe)
//! implementation: register it with the engine and it counts every event it is sent.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use jobwire_core::Subscribe;
//! use jobwire_prometheus::{PrometheusMetrics, TextEncoder};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = PrometheusMetrics::new()?;
//! let subscriber: Arc<dyn Subscribe> = Arc::new(metrics.clone());
//! // Engine::builder(..).with_subscriber(subscriber)
//!
//! let text = TextEncoder::new().encode_to_string(&metrics.gather())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Metrics
//! - `jobwire_updates_sent_total{endpoint}` - Counter
//! - `jobwire_updates_acked_total{endpoint}` - Counter
//! - `jobwire_updates_coalesced_total{endpoint}` - Counter
//! - `jobwire_endpoint_failures_total{endpoint, kind}` - Counter
//! - `jobwire_queue_depth{endpoint}` - Gauge
//! - `jobwire_transitions_total{state}` - Counter
//! - `jobwire_transitions_rejected_total` - Counter
//! - `jobwire_jobs_purged_total` - Counter
//! - `jobwire_poll_failures_total` - Counter
//!
//! ## HTTP Server
//! This crate does NOT serve `/metrics`; encode [`PrometheusMetrics::gather`]
//! from whatever HTTP stack the process already runs.

mod backend;
pub use backend::PrometheusMetrics;

pub use prometheus::{Encoder, Registry, TextEncoder};

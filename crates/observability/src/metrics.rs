//! Prometheus metrics
//!
//! Handles are resolved through the global `metrics` recorder, so every
//! helper here is a no-op until [`init_metrics`] installs the exporter.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Start the Prometheus exporter on `0.0.0.0:<port>/metrics`
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    tracing::info!(%addr, "Metrics server listening");
    Ok(())
}

/// Metrics emitted by the price pipeline
///
/// * `oracle_source_fetch_total{source,outcome}`
/// * `oracle_source_fetch_latency_seconds{source}`
/// * `oracle_consensus_price`, `oracle_consensus_confidence`
/// * `oracle_consensus_failures_total`
/// * `oracle_outliers_total{source}`
/// * `oracle_circuit_state{source}` (0 closed, 1 half-open, 2 open)
/// * `oracle_volatility{window,methodology}`
/// * `oracle_closes_rejected_total{reason}`
#[derive(Clone)]
pub struct PipelineMetrics {
    consensus_price: Gauge,
    consensus_confidence: Gauge,
    consensus_failures: Counter,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            consensus_price: gauge!("oracle_consensus_price"),
            consensus_confidence: gauge!("oracle_consensus_confidence"),
            consensus_failures: counter!("oracle_consensus_failures_total"),
        }
    }

    /// Record one source fetch; `outcome` is `ok` or an error kind
    pub fn record_fetch(&self, source: &str, outcome: &str, latency: Duration) {
        counter!(
            "oracle_source_fetch_total",
            "source" => source.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
        histogram!("oracle_source_fetch_latency_seconds", "source" => source.to_string())
            .record(latency.as_secs_f64());
    }

    pub fn record_consensus(&self, price: f64, confidence: f64) {
        self.consensus_price.set(price);
        self.consensus_confidence.set(confidence);
    }

    pub fn consensus_failed(&self) {
        self.consensus_failures.increment(1);
    }

    pub fn outlier_rejected(&self, source: &str) {
        counter!("oracle_outliers_total", "source" => source.to_string()).increment(1);
    }

    /// `state` uses the encoding documented on the struct
    pub fn set_circuit_state(&self, source: &str, state: u8) {
        gauge!("oracle_circuit_state", "source" => source.to_string()).set(f64::from(state));
    }

    pub fn set_volatility(&self, window_days: u32, methodology: &str, value: f64) {
        gauge!(
            "oracle_volatility",
            "window" => window_days.to_string(),
            "methodology" => methodology.to_string()
        )
        .set(value);
    }

    pub fn close_rejected(&self, reason: &str) {
        counter!("oracle_closes_rejected_total", "reason" => reason.to_string()).increment(1);
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Request metrics for the read API
///
/// * `api_requests_total{route,status}`
/// * `api_request_duration_seconds{route}`
#[derive(Clone)]
pub struct ApiMetrics {
    route: String,
    request_duration: Histogram,
}

impl ApiMetrics {
    pub fn new(route: &str) -> Self {
        Self {
            route: route.to_string(),
            request_duration: histogram!("api_request_duration_seconds", "route" => route.to_string()),
        }
    }

    pub fn record_request(&self, duration: Duration, status_code: u16) {
        counter!(
            "api_requests_total",
            "route" => self.route.clone(),
            "status" => status_code.to_string()
        )
        .increment(1);
        self.request_duration.record(duration.as_secs_f64());
    }

    pub fn route(&self) -> &str {
        &self.route
    }
}

/// Records the request duration when dropped
///
/// ```ignore
/// let mut timer = RequestTimer::new(&metrics);
/// // ... handle request ...
/// timer.set_status(503);
/// ```
pub struct RequestTimer<'a> {
    metrics: &'a ApiMetrics,
    start: Instant,
    status_code: u16,
}

impl<'a> RequestTimer<'a> {
    pub fn new(metrics: &'a ApiMetrics) -> Self {
        Self {
            metrics,
            start: Instant::now(),
            status_code: 200,
        }
    }

    pub fn set_status(&mut self, code: u16) {
        self.status_code = code;
    }
}

impl Drop for RequestTimer<'_> {
    fn drop(&mut self) {
        self.metrics.record_request(self.start.elapsed(), self.status_code);
    }
}

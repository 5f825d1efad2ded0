//! Prometheus exposition for the census.
//!
//! ## Metrics
//!
//! **Per-table gauges** (label `table`):
//! - `table_item_count` — current cardinality
//! - `table_pressure` — cardinality / capacity, -1 when capacity is unknown
//! - `table_capacity` — declared capacity
//! - `table_replica_item_count` — replica count when the poller is authority
//! - `table_kernel_item_count` — kernel count when the replica is authority
//!
//! **Counters:**
//! - `tc_events_total` — applied mutations by outcome
//! - `tc_polls_total` — poll cycles by status
//! - `tc_errors_total` — errors by type
//!
//! **Gauges / histograms / info:**
//! - `tc_uptime_seconds`
//! - `tc_poll_duration_seconds`
//! - `tc_build_info` — version

use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{CensusField, CensusSink, TableLabel};

/// Default scrape port.
pub const DEFAULT_METRICS_PORT: u16 = 2112;

/// Configuration for the metrics endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_METRICS_PORT,
            path: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("invalid metrics bind address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("failed to start metrics server on {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    #[error("failed to spawn metrics thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("metrics registry error: {0}")]
    Registry(#[from] prometheus::Error),
}

impl From<MetricsError> for tc_common::Error {
    fn from(err: MetricsError) -> Self {
        match err {
            MetricsError::InvalidAddress { .. } => tc_common::Error::Config(err.to_string()),
            MetricsError::Spawn(e) => tc_common::Error::Io(e),
            other => tc_common::Error::Io(std::io::Error::other(other.to_string())),
        }
    }
}

/// Registry plus every census series.
///
/// Updates are atomic inside the prometheus crate, so clones can be handed to
/// the consumer, the poller and the server thread.
#[derive(Clone)]
pub struct CensusMetrics {
    pub registry: Registry,

    pub item_count: GaugeVec,
    pub pressure: GaugeVec,
    pub capacity: GaugeVec,
    pub replica_item_count: GaugeVec,
    pub kernel_item_count: GaugeVec,

    pub events_total: IntCounterVec,
    pub polls_total: IntCounterVec,
    pub errors_total: IntCounterVec,

    pub uptime_seconds: IntGauge,
    pub poll_duration_seconds: Histogram,

    started_at: Instant,
}

fn table_gauge(registry: &Registry, name: &str, help: &str) -> Result<GaugeVec, prometheus::Error> {
    let gauge = GaugeVec::new(Opts::new(name, help), &["table"])?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl CensusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let item_count = table_gauge(
            &registry,
            CensusField::ItemCount.metric_name(),
            "Current number of entries in the table",
        )?;
        let pressure = table_gauge(
            &registry,
            CensusField::Pressure.metric_name(),
            "Fraction of table capacity in use, -1 when capacity is unknown",
        )?;
        let capacity = table_gauge(
            &registry,
            CensusField::Capacity.metric_name(),
            "Declared table capacity",
        )?;
        let replica_item_count = table_gauge(
            &registry,
            CensusField::ReplicaItemCount.metric_name(),
            "Entry count held by the shadow replica",
        )?;
        let kernel_item_count = table_gauge(
            &registry,
            CensusField::KernelItemCount.metric_name(),
            "Entry count reported by kernel enumeration",
        )?;

        let events_total = IntCounterVec::new(
            Opts::new("tc_events_total", "Mutation events applied, by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let polls_total = IntCounterVec::new(
            Opts::new("tc_polls_total", "Census poll cycles, by status"),
            &["status"],
        )?;
        registry.register(Box::new(polls_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("tc_errors_total", "Errors by type"),
            &["type"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let uptime_seconds = IntGauge::new("tc_uptime_seconds", "Controller uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let poll_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("tc_poll_duration_seconds", "Census poll cycle duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(poll_duration_seconds.clone()))?;

        let build_info = IntGauge::with_opts(
            Opts::new("tc_build_info", "Build information")
                .const_label("version", env!("CARGO_PKG_VERSION")),
        )?;
        build_info.set(1);
        registry.register(Box::new(build_info))?;

        Ok(Self {
            registry,
            item_count,
            pressure,
            capacity,
            replica_item_count,
            kernel_item_count,
            events_total,
            polls_total,
            errors_total,
            uptime_seconds,
            poll_duration_seconds,
            started_at: Instant::now(),
        })
    }

    fn gauge_for(&self, field: CensusField) -> &GaugeVec {
        match field {
            CensusField::ItemCount => &self.item_count,
            CensusField::Pressure => &self.pressure,
            CensusField::Capacity => &self.capacity,
            CensusField::ReplicaItemCount => &self.replica_item_count,
            CensusField::KernelItemCount => &self.kernel_item_count,
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        self.uptime_seconds
            .set(self.started_at.elapsed().as_secs() as i64);

        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl CensusSink for CensusMetrics {
    fn set(&self, table: &TableLabel, field: CensusField, value: f64) {
        self.gauge_for(field)
            .with_label_values(&[table.as_str()])
            .set(value);
    }

    fn record_event(&self, outcome: &str) {
        self.events_total.with_label_values(&[outcome]).inc();
    }

    fn record_poll(&self, status: &str, duration_secs: f64) {
        self.polls_total.with_label_values(&[status]).inc();
        self.poll_duration_seconds.observe(duration_secs);
    }

    fn record_error(&self, error_type: &str) {
        self.errors_total.with_label_values(&[error_type]).inc();
    }
}

/// Handle to the running metrics HTTP server.
pub struct MetricsServer {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl MetricsServer {
    /// Start the metrics HTTP server on a background thread.
    pub fn start(config: &MetricsConfig, metrics: CensusMetrics) -> Result<Self, MetricsError> {
        let raw = format!("{}:{}", config.bind, config.port);
        let addr: SocketAddr = raw.parse().map_err(|e: std::net::AddrParseError| {
            MetricsError::InvalidAddress {
                addr: raw.clone(),
                reason: e.to_string(),
            }
        })?;

        let server = tiny_http::Server::http(addr).map_err(|e| MetricsError::Bind {
            addr,
            reason: e.to_string(),
        })?;

        info!(addr = %addr, path = %config.path, "metrics server started");

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let path = config.path.clone();

        let thread = thread::Builder::new()
            .name("tc-metrics".to_string())
            .spawn(move || {
                serve_loop(server, &metrics, &shutdown_clone, &path);
            })?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the server and join its thread.
    pub fn shutdown(mut self) {
        self.stop();
        info!("metrics server stopped");
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock a pending accept.
        let _ = std::net::TcpStream::connect(self.addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn text_plain() -> Option<tiny_http::Header> {
    tiny_http::Header::from_bytes(
        &b"Content-Type"[..],
        &b"text/plain; version=0.0.4; charset=utf-8"[..],
    )
    .ok()
}

/// Serve the metrics path and health checks; everything else is 404.
fn serve_loop(
    server: tiny_http::Server,
    metrics: &CensusMetrics,
    shutdown: &AtomicBool,
    path: &str,
) {
    let path_slash = format!("{}/", path);
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let request = match server.recv_timeout(Duration::from_secs(1)) {
            Ok(Some(req)) => req,
            Ok(None) => continue,
            Err(e) => {
                if !shutdown.load(Ordering::SeqCst) {
                    error!(error = %e, "metrics server accept error");
                }
                break;
            }
        };

        if shutdown.load(Ordering::SeqCst) {
            let _ = request
                .respond(tiny_http::Response::from_string("shutting down").with_status_code(503));
            break;
        }

        let url = request.url().to_string();
        debug!(method = %request.method(), url = %url, "metrics scrape");

        if url == path || url == path_slash {
            match metrics.render() {
                Ok(body) => {
                    let mut response = tiny_http::Response::from_string(body);
                    if let Some(header) = text_plain() {
                        response = response.with_header(header);
                    }
                    if let Err(e) = request.respond(response) {
                        warn!(error = %e, "failed to send metrics response");
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to render metrics");
                    metrics.record_error("render");
                    let _ = request.respond(
                        tiny_http::Response::from_string(format!("error: {}", e))
                            .with_status_code(500),
                    );
                }
            }
        } else if url == "/health" || url == "/healthz" {
            let _ = request.respond(tiny_http::Response::from_string("ok"));
        } else {
            let _ = request
                .respond(tiny_http::Response::from_string("not found").with_status_code(404));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::{LabelMode, Publisher, Strategy};
    use tc_common::{TableId, TableName};

    #[test]
    fn test_metrics_creation() {
        let metrics = CensusMetrics::new().unwrap();
        assert!(metrics.render().unwrap().contains("tc_build_info"));
    }

    #[test]
    fn test_table_gauges_render_with_label() {
        let metrics = CensusMetrics::new().unwrap();
        let publisher = Publisher::sole(Arc::new(metrics.clone()), LabelMode::Id, Strategy::Poller);
        let label = publisher.label(TableId(12), &TableName::new("my_table"));
        publisher.publish(&label, 37, 1024);

        let output = metrics.render().unwrap();
        assert!(output.contains("table_item_count{table=\"12\"} 37"));
        assert!(output.contains("table_capacity{table=\"12\"} 1024"));
        assert!(output.contains("table_pressure{table=\"12\"} 0.0361328125"));
    }

    #[test]
    fn test_unknown_capacity_publishes_sentinel() {
        let metrics = CensusMetrics::new().unwrap();
        let label = TableLabel::new(LabelMode::Name, TableId(3), &TableName::new("events"));
        metrics.set(&label, CensusField::Pressure, crate::publish::PRESSURE_UNKNOWN);
        let output = metrics.render().unwrap();
        assert!(output.contains("table_pressure{table=\"events\"} -1"));
    }

    #[test]
    fn test_counter_increments() {
        let metrics = CensusMetrics::new().unwrap();

        metrics.record_event("inserted");
        metrics.record_event("inserted");
        metrics.record_event("remove_of_absent");
        metrics.record_poll("success", 0.002);
        metrics.record_poll("failed", 0.001);
        metrics.record_error("malformed_census_line");

        let output = metrics.render().unwrap();
        assert!(output.contains("tc_events_total{outcome=\"inserted\"} 2"));
        assert!(output.contains("tc_events_total{outcome=\"remove_of_absent\"} 1"));
        assert!(output.contains("tc_polls_total{status=\"success\"} 1"));
        assert!(output.contains("tc_errors_total{type=\"malformed_census_line\"} 1"));
        assert!(output.contains("tc_poll_duration_seconds_count 2"));
    }

    #[test]
    fn test_render_valid_prometheus_format() {
        let metrics = CensusMetrics::new().unwrap();
        metrics.record_poll("success", 0.01);

        let output = metrics.render().unwrap();
        assert!(output.contains("# HELP tc_build_info"));
        assert!(output.contains("# TYPE tc_build_info gauge"));
        assert!(output.contains("# HELP tc_uptime_seconds"));
        assert!(output.contains("# TYPE tc_polls_total counter"));
        assert!(output.contains("# TYPE tc_poll_duration_seconds histogram"));
    }

    #[test]
    fn test_build_info_has_version() {
        let metrics = CensusMetrics::new().unwrap();
        let output = metrics.render().unwrap();
        assert!(output.contains(&format!("version=\"{}\"", env!("CARGO_PKG_VERSION"))));
    }

    #[test]
    fn test_invalid_bind_address() {
        let config = MetricsConfig {
            bind: "not-an-address".to_string(),
            ..MetricsConfig::default()
        };
        let err = MetricsServer::start(&config, CensusMetrics::new().unwrap()).err();
        assert!(matches!(err, Some(MetricsError::InvalidAddress { .. })));
    }

    #[test]
    fn test_metrics_server_starts_and_serves() {
        let config = MetricsConfig {
            port: 21120 + (std::process::id() % 1000) as u16,
            ..MetricsConfig::default()
        };

        let metrics = CensusMetrics::new().unwrap();
        metrics.record_event("inserted");

        let server = match MetricsServer::start(&config, metrics) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("skipping metrics server test: {}", e);
                return;
            }
        };

        std::thread::sleep(Duration::from_millis(100));

        if let Ok(mut stream) = std::net::TcpStream::connect(server.addr()) {
            use std::io::{Read, Write};
            let _ = stream.write_all(b"GET /metrics HTTP/1.0\r\nHost: localhost\r\n\r\n");
            let mut buf = String::new();
            let _ = stream.read_to_string(&mut buf);
            assert!(buf.contains("200 OK"), "got: {}", &buf[..100.min(buf.len())]);
            assert!(buf.contains("tc_events_total"));
        }

        if let Ok(mut stream) = std::net::TcpStream::connect(server.addr()) {
            use std::io::{Read, Write};
            let _ = stream.write_all(b"GET /nope HTTP/1.0\r\nHost: localhost\r\n\r\n");
            let mut buf = String::new();
            let _ = stream.read_to_string(&mut buf);
            assert!(buf.contains("404"));
        }

        server.shutdown();
    }

    #[test]
    fn test_default_config() {
        let config = MetricsConfig::default();
        assert_eq!(config.port, 2112);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.path, "/metrics");
        assert!(config.enabled);
    }
}

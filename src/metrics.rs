//! Metrics sink: a small trait for counters/gauges/histograms,
//! injected through constructors rather than registered in a global
//! Prometheus registry — see the design note on global mutable metrics.

use std::time::Duration;

/// Labels common to per-tunnel, per-tenant observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

pub trait MetricsSink: Send + Sync {
    fn bytes_transferred(&self, tunnel_id: &str, tenant_id: &str, direction: Direction, bytes: u64) {
        let _ = (tunnel_id, tenant_id, direction, bytes);
    }
    fn connection_handled(&self, tunnel_id: &str, tenant_id: &str) {
        let _ = (tunnel_id, tenant_id);
    }
    fn active_connections(&self, tunnel_id: &str, delta: i64) {
        let _ = (tunnel_id, delta);
    }
    fn connection_duration(&self, tunnel_id: &str, duration: Duration) {
        let _ = (tunnel_id, duration);
    }
    fn buffer_pool_size(&self, size: u64) {
        let _ = size;
    }
    fn buffer_pool_usage(&self, usage: u64) {
        let _ = usage;
    }
    fn error(&self, error_kind: &str, tunnel_id: &str, tenant_id: &str) {
        let _ = (error_kind, tunnel_id, tenant_id);
    }
    fn heartbeat_latency(&self, latency: Duration) {
        let _ = latency;
    }
}

/// Default sink: discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

#[cfg(feature = "metrics")]
pub mod prometheus_sink {
    //! Optional Prometheus-backed sink. Kept as a pluggable adapter, not a
    //! core dependency — the scrape HTTP endpoint itself is out of scope
    //! for this crate.

    use std::time::Duration;

    use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry};

    use super::{Direction, MetricsSink};

    pub struct PrometheusMetrics {
        bytes_transferred: CounterVec,
        connections_handled: CounterVec,
        active_connections: GaugeVec,
        connection_duration: HistogramVec,
        buffer_pool_size: prometheus::Gauge,
        buffer_pool_usage: prometheus::Gauge,
        errors_total: CounterVec,
        heartbeat_latency: prometheus::Histogram,
    }

    impl PrometheusMetrics {
        pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
            let bytes_transferred = CounterVec::new(
                Opts::new("bytes_transferred", "Bytes transferred through tunnels"),
                &["tunnel_id", "tenant_id", "direction"],
            )?;
            let connections_handled = CounterVec::new(
                Opts::new("connections_handled", "Proxied connections handled"),
                &["tunnel_id", "tenant_id"],
            )?;
            let active_connections = GaugeVec::new(
                Opts::new("active_connections", "Currently active proxied connections"),
                &["tunnel_id"],
            )?;
            let connection_duration = HistogramVec::new(
                prometheus::HistogramOpts::new(
                    "connection_duration_seconds",
                    "Proxied connection lifetime",
                ),
                &["tunnel_id"],
            )?;
            let buffer_pool_size =
                prometheus::Gauge::new("buffer_pool_size", "Configured pump buffer pool size")?;
            let buffer_pool_usage =
                prometheus::Gauge::new("buffer_pool_usage", "Pump buffer pool bytes in use")?;
            let errors_total = CounterVec::new(
                Opts::new("errors_total", "Errors observed by kind"),
                &["error_kind", "tunnel_id", "tenant_id"],
            )?;
            let heartbeat_latency = prometheus::Histogram::with_opts(
                prometheus::HistogramOpts::new("heartbeat_latency_seconds", "Heartbeat round-trip time"),
            )?;

            registry.register(Box::new(bytes_transferred.clone()))?;
            registry.register(Box::new(connections_handled.clone()))?;
            registry.register(Box::new(active_connections.clone()))?;
            registry.register(Box::new(connection_duration.clone()))?;
            registry.register(Box::new(buffer_pool_size.clone()))?;
            registry.register(Box::new(buffer_pool_usage.clone()))?;
            registry.register(Box::new(errors_total.clone()))?;
            registry.register(Box::new(heartbeat_latency.clone()))?;

            Ok(Self {
                bytes_transferred,
                connections_handled,
                active_connections,
                connection_duration,
                buffer_pool_size,
                buffer_pool_usage,
                errors_total,
                heartbeat_latency,
            })
        }
    }

    impl MetricsSink for PrometheusMetrics {
        fn bytes_transferred(&self, tunnel_id: &str, tenant_id: &str, direction: Direction, bytes: u64) {
            let dir = match direction {
                Direction::Inbound => "in",
                Direction::Outbound => "out",
            };
            self.bytes_transferred
                .with_label_values(&[tunnel_id, tenant_id, dir])
                .inc_by(bytes as f64);
        }

        fn connection_handled(&self, tunnel_id: &str, tenant_id: &str) {
            self.connections_handled
                .with_label_values(&[tunnel_id, tenant_id])
                .inc();
        }

        fn active_connections(&self, tunnel_id: &str, delta: i64) {
            self.active_connections
                .with_label_values(&[tunnel_id])
                .add(delta as f64);
        }

        fn connection_duration(&self, tunnel_id: &str, duration: Duration) {
            self.connection_duration
                .with_label_values(&[tunnel_id])
                .observe(duration.as_secs_f64());
        }

        fn buffer_pool_size(&self, size: u64) {
            self.buffer_pool_size.set(size as f64);
        }

        fn buffer_pool_usage(&self, usage: u64) {
            self.buffer_pool_usage.set(usage as f64);
        }

        fn error(&self, error_kind: &str, tunnel_id: &str, tenant_id: &str) {
            self.errors_total
                .with_label_values(&[error_kind, tunnel_id, tenant_id])
                .inc();
        }

        fn heartbeat_latency(&self, latency: Duration) {
            self.heartbeat_latency.observe(latency.as_secs_f64());
        }
    }
}

#[cfg(feature = "metrics")]
pub use prometheus_sink::PrometheusMetrics;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_accepts_all_calls_without_panicking() {
        let sink = NoopMetrics;
        sink.bytes_transferred("t1", "tenant", Direction::Inbound, 1024);
        sink.connection_handled("t1", "tenant");
        sink.active_connections("t1", 1);
        sink.connection_duration("t1", Duration::from_secs(1));
        sink.buffer_pool_size(4096);
        sink.buffer_pool_usage(2048);
        sink.error("rate_limit_exceeded", "t1", "tenant");
        sink.heartbeat_latency(Duration::from_millis(5));
    }
}

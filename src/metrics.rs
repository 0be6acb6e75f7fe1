use crate::state::Snapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub cycles_total: CounterVec,
    pub collect_errors_total: CounterVec,
    pub strategy_fallbacks_total: CounterVec,
    pub publishes_total: Counter,
    pub publishes_dropped_total: Counter,
    pub broker_reconnects_total: Counter,
    pub broker_connected: Gauge,
    pub scrape_count_total: Counter,
    pub cpu_load_percent: Gauge,
    pub memory_usage_percent: Gauge,
    pub disk_usage_percent: Gauge,
    pub cpu_temperature_celsius: Gauge,
    pub net_rx_bytes_per_sec: Gauge,
    pub net_tx_bytes_per_sec: Gauge,
    pub host_uptime_seconds: Gauge,
    pub throttled: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let cycles_total = CounterVec::new(
            opts!("hostpulse_cycles_total", "Completed sampling cycles by cadence"),
            &["cadence"],
        )?;
        let collect_errors_total = CounterVec::new(
            opts!(
                "hostpulse_collect_errors_total",
                "Failed collector runs by collector"
            ),
            &["collector"],
        )?;
        let strategy_fallbacks_total = CounterVec::new(
            opts!(
                "hostpulse_strategy_fallbacks_total",
                "Switches from the accelerated to the native strategy"
            ),
            &["collector"],
        )?;
        let publishes_total = Counter::with_opts(opts!(
            "hostpulse_publishes_total",
            "Snapshots handed to an open broker channel"
        ))?;
        let publishes_dropped_total = Counter::with_opts(opts!(
            "hostpulse_publishes_dropped_total",
            "Snapshots dropped because the broker channel was not open"
        ))?;
        let broker_reconnects_total = Counter::with_opts(opts!(
            "hostpulse_broker_reconnects_total",
            "Reconnect attempts to the broker"
        ))?;
        let broker_connected = Gauge::with_opts(opts!(
            "hostpulse_broker_connected",
            "1 when the broker channel is open"
        ))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "hostpulse_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let cpu_load_percent = Gauge::with_opts(opts!(
            "hostpulse_cpu_load_percent",
            "Aggregate CPU load in percent (0..100)"
        ))?;
        let memory_usage_percent = Gauge::with_opts(opts!(
            "hostpulse_memory_usage_percent",
            "Memory usage in percent"
        ))?;
        let disk_usage_percent = Gauge::with_opts(opts!(
            "hostpulse_disk_usage_percent",
            "System disk usage in percent"
        ))?;
        let cpu_temperature_celsius = Gauge::with_opts(opts!(
            "hostpulse_cpu_temperature_celsius",
            "CPU package temperature, -1 when no sensor reading is available"
        ))?;
        let net_rx_bytes_per_sec = Gauge::with_opts(opts!(
            "hostpulse_net_rx_bytes_per_sec",
            "Received bytes per second on the publishing interface"
        ))?;
        let net_tx_bytes_per_sec = Gauge::with_opts(opts!(
            "hostpulse_net_tx_bytes_per_sec",
            "Transmitted bytes per second on the publishing interface"
        ))?;
        let host_uptime_seconds = Gauge::with_opts(opts!(
            "hostpulse_host_uptime_seconds",
            "Host uptime in seconds"
        ))?;
        let throttled = Gauge::with_opts(opts!(
            "hostpulse_throttled",
            "1 when the firmware reports under-voltage or throttling"
        ))?;

        register(&registry, &cycles_total)?;
        register(&registry, &collect_errors_total)?;
        register(&registry, &strategy_fallbacks_total)?;
        register(&registry, &publishes_total)?;
        register(&registry, &publishes_dropped_total)?;
        register(&registry, &broker_reconnects_total)?;
        register(&registry, &broker_connected)?;
        register(&registry, &scrape_count_total)?;
        register(&registry, &cpu_load_percent)?;
        register(&registry, &memory_usage_percent)?;
        register(&registry, &disk_usage_percent)?;
        register(&registry, &cpu_temperature_celsius)?;
        register(&registry, &net_rx_bytes_per_sec)?;
        register(&registry, &net_tx_bytes_per_sec)?;
        register(&registry, &host_uptime_seconds)?;
        register(&registry, &throttled)?;

        Ok(Arc::new(Self {
            registry,
            cycles_total,
            collect_errors_total,
            strategy_fallbacks_total,
            publishes_total,
            publishes_dropped_total,
            broker_reconnects_total,
            broker_connected,
            scrape_count_total,
            cpu_load_percent,
            memory_usage_percent,
            disk_usage_percent,
            cpu_temperature_celsius,
            net_rx_bytes_per_sec,
            net_tx_bytes_per_sec,
            host_uptime_seconds,
            throttled,
        }))
    }

    pub fn update_from_snapshot(&self, snapshot: &Snapshot) {
        self.cpu_load_percent.set(snapshot.cpu_load_percent);
        self.memory_usage_percent.set(snapshot.mem_percent);
        self.disk_usage_percent.set(snapshot.disk_percent);
        self.cpu_temperature_celsius
            .set(snapshot.cpu_temp_celsius.unwrap_or(-1.0));
        self.net_rx_bytes_per_sec
            .set(snapshot.net_rx_bytes_per_sec as f64);
        self.net_tx_bytes_per_sec
            .set(snapshot.net_tx_bytes_per_sec as f64);
        self.host_uptime_seconds.set(snapshot.uptime_seconds as f64);
        self.throttled
            .set(if snapshot.throttled { 1.0 } else { 0.0 });
    }

    pub fn inc_cycle(&self, cadence: &str) {
        self.cycles_total.with_label_values(&[cadence]).inc();
    }

    pub fn inc_collect_error(&self, collector: &str) {
        self.collect_errors_total
            .with_label_values(&[collector])
            .inc();
    }

    pub fn inc_strategy_fallback(&self, collector: &str) {
        self.strategy_fallbacks_total
            .with_label_values(&[collector])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.broker_connected
            .set(if connected { 1.0 } else { 0.0 });
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_gauges_and_sentinel_temperature() {
        let metrics = Metrics::new().unwrap();
        let mut snap = Snapshot::default();
        snap.cpu_load_percent = 42.0;
        metrics.update_from_snapshot(&snap);
        assert_eq!(metrics.cpu_load_percent.get(), 42.0);
        assert_eq!(metrics.cpu_temperature_celsius.get(), -1.0);

        snap.cpu_temp_celsius = Some(51.5);
        metrics.update_from_snapshot(&snap);
        assert_eq!(metrics.cpu_temperature_celsius.get(), 51.5);
    }

    #[test]
    fn encoded_output_contains_labelled_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.inc_collect_error("disk");
        metrics.inc_strategy_fallback("cpu_load");
        metrics.inc_cycle("light");
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("hostpulse_collect_errors_total{collector=\"disk\"} 1"));
        assert!(text.contains("hostpulse_strategy_fallbacks_total{collector=\"cpu_load\"} 1"));
        assert!(text.contains("hostpulse_cycles_total{cadence=\"light\"} 1"));
    }
}

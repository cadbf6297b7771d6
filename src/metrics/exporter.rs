use crate::metrics::MeterRegistry;
use anyhow::Result;
use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts};
use std::time::{Duration, Instant};
use tracing::info;

/// Exporter self-metrics, registered at process start and updated by the
/// orchestrator regardless of database state.
#[derive(Clone)]
pub struct ExporterMetrics {
    total_scraped: IntCounter,
    total_error: IntCounter,
    collector_error: IntCounterVec,
    up: Gauge,
    scrape_duration: Histogram,
    start_time: Instant,
}

impl ExporterMetrics {
    pub fn new(registry: &MeterRegistry) -> Result<Self> {
        let total_scraped = IntCounter::with_opts(Opts::new(
            "greengage_exporter_total_scraped",
            "Total number of scrapes",
        ))?;
        let total_error = IntCounter::with_opts(Opts::new(
            "greengage_exporter_total_error",
            "Total number of scrape errors",
        ))?;
        let collector_error = IntCounterVec::new(
            Opts::new(
                "greengage_exporter_collector_error",
                "Number of errors per collector",
            ),
            &["collector"],
        )?;
        let up = Gauge::with_opts(Opts::new(
            "greengage_up",
            "Whether greengage cluster is reachable (1=up, 0=down)",
        ))?;
        let scrape_duration = Histogram::with_opts(HistogramOpts::new(
            "greengage_exporter_scrape_duration_seconds",
            "Duration of the last scrape in seconds",
        ))?;

        let prom = registry.prometheus();
        prom.register(Box::new(total_scraped.clone()))?;
        prom.register(Box::new(total_error.clone()))?;
        prom.register(Box::new(collector_error.clone()))?;
        prom.register(Box::new(up.clone()))?;
        prom.register(Box::new(scrape_duration.clone()))?;

        let start_time = Instant::now();
        registry.register_gauge(
            "greengage_exporter_uptime_seconds",
            "Duration in seconds since the exporter started",
            &[],
            move || start_time.elapsed().as_secs_f64(),
        )?;

        info!("Exporter metrics initialized");

        Ok(Self {
            total_scraped,
            total_error,
            collector_error,
            up,
            scrape_duration,
            start_time,
        })
    }

    pub fn increment_total_scraped(&self) {
        self.total_scraped.inc();
    }

    pub fn increment_total_error(&self) {
        self.total_error.inc();
    }

    /// Per-collector error accounting, so a failing collector can be
    /// pinpointed from `rate(greengage_exporter_collector_error[5m])`.
    pub fn increment_collector_error(&self, collector: &str) {
        self.collector_error.with_label_values(&[collector]).inc();
    }

    pub fn record_scrape_duration(&self, duration: Duration) {
        self.scrape_duration.observe(duration.as_secs_f64());
    }

    pub fn set_greengage_up(&self, up: bool) {
        self.up.set(if up { 1.0 } else { 0.0 });
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn total_scraped_count(&self) -> u64 {
        self.total_scraped.get()
    }

    pub fn total_error_count(&self) -> u64 {
        self.total_error.get()
    }

    pub fn collector_error_count(&self, collector: &str) -> u64 {
        self.collector_error.with_label_values(&[collector]).get()
    }

    pub fn up_value(&self) -> f64 {
        self.up.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> (MeterRegistry, ExporterMetrics) {
        let registry = MeterRegistry::new().unwrap();
        let metrics = ExporterMetrics::new(&registry).unwrap();
        (registry, metrics)
    }

    #[test]
    fn test_counters_accumulate() {
        let (_registry, metrics) = metrics();

        metrics.increment_total_scraped();
        metrics.increment_total_scraped();
        metrics.increment_total_error();

        assert_eq!(metrics.total_scraped_count(), 2);
        assert_eq!(metrics.total_error_count(), 1);
    }

    #[test]
    fn test_per_collector_errors_are_tagged() {
        let (registry, metrics) = metrics();

        metrics.increment_collector_error("segment");
        metrics.increment_collector_error("segment");
        metrics.increment_collector_error("locked_sessions");

        assert_eq!(metrics.collector_error_count("segment"), 2);
        assert_eq!(metrics.collector_error_count("locked_sessions"), 1);

        let text = registry.encode().unwrap();
        assert!(text.contains("greengage_exporter_collector_error{collector=\"segment\"} 2"));
    }

    #[test]
    fn test_up_gauge_transitions() {
        let (_registry, metrics) = metrics();

        metrics.set_greengage_up(true);
        assert_eq!(metrics.up_value(), 1.0);
        metrics.set_greengage_up(false);
        assert_eq!(metrics.up_value(), 0.0);
    }

    #[test]
    fn test_uptime_gauge_is_exposed() {
        let (registry, _metrics) = metrics();
        let text = registry.encode().unwrap();
        assert!(text.contains("greengage_exporter_uptime_seconds"));
    }

    #[test]
    fn test_scrape_duration_recorded() {
        let (registry, metrics) = metrics();
        metrics.record_scrape_duration(Duration::from_millis(120));

        let text = registry.encode().unwrap();
        assert!(text.contains("greengage_exporter_scrape_duration_seconds_count 1"));
    }
}

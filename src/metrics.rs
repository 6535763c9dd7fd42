use crate::state::FleetStats;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub console_uptime_seconds: Gauge,
    pub console_scrape_count_total: Counter,
    pub console_refresh_total: CounterVec,
    pub console_fleet_instances: Gauge,
    pub console_fleet_running_instances: Gauge,
    pub console_provision_submissions_total: CounterVec,
    pub console_provision_polls_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let console_uptime_seconds = Gauge::with_opts(opts!(
            "console_uptime_seconds",
            "Seconds since the console process started"
        ))?;
        let console_scrape_count_total = Counter::with_opts(opts!(
            "console_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let console_refresh_total = CounterVec::new(
            opts!(
                "console_refresh_total",
                "Telemetry refreshes by view and result"
            ),
            &["view", "result"],
        )?;
        let console_fleet_instances = Gauge::with_opts(opts!(
            "console_fleet_instances",
            "Instances in the last fleet snapshot"
        ))?;
        let console_fleet_running_instances = Gauge::with_opts(opts!(
            "console_fleet_running_instances",
            "Running instances in the last fleet snapshot"
        ))?;
        let console_provision_submissions_total = CounterVec::new(
            opts!(
                "console_provision_submissions_total",
                "Create requests sent for new instances by result"
            ),
            &["result"],
        )?;
        let console_provision_polls_total = CounterVec::new(
            opts!(
                "console_provision_polls_total",
                "Token status checks by outcome"
            ),
            &["outcome"],
        )?;

        register(&registry, &console_uptime_seconds)?;
        register(&registry, &console_scrape_count_total)?;
        register(&registry, &console_refresh_total)?;
        register(&registry, &console_fleet_instances)?;
        register(&registry, &console_fleet_running_instances)?;
        register(&registry, &console_provision_submissions_total)?;
        register(&registry, &console_provision_polls_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            console_uptime_seconds,
            console_scrape_count_total,
            console_refresh_total,
            console_fleet_instances,
            console_fleet_running_instances,
            console_provision_submissions_total,
            console_provision_polls_total,
        }))
    }

    pub fn update_fleet(&self, stats: &FleetStats) {
        self.console_fleet_instances.set(stats.total_vms as f64);
        self.console_fleet_running_instances
            .set(stats.running_count as f64);
    }

    pub fn inc_scrape_count(&self) {
        self.console_scrape_count_total.inc();
    }

    pub fn inc_refresh(&self, view: &str, result: &str) {
        self.console_refresh_total
            .with_label_values(&[view, result])
            .inc();
    }

    pub fn inc_submission(&self, result: &str) {
        self.console_provision_submissions_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn inc_poll(&self, outcome: &str) {
        self.console_provision_polls_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.console_uptime_seconds.set(uptime);

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

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_counters_with_labels() {
        let metrics = Metrics::new().expect("инициализация метрик");
        metrics.inc_refresh("fleet", "ok");
        metrics.inc_poll("installed");
        metrics.update_fleet(&FleetStats {
            total_vms: 3,
            running_count: 2,
            ..FleetStats::default()
        });

        let text = String::from_utf8(metrics.encode_metrics().expect("кодирование")).unwrap();
        assert!(text.contains("console_refresh_total{result=\"ok\",view=\"fleet\"} 1"));
        assert!(text.contains("console_provision_polls_total{outcome=\"installed\"} 1"));
        assert!(text.contains("console_fleet_running_instances 2"));
        assert!(text.contains("console_uptime_seconds"));
    }
}

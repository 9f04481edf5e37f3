use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub orders_total: IntCounterVec,
    pub offers_total: IntCounterVec,
    pub orders_in_flight: IntGauge,
    pub accept_latency_seconds: HistogramVec,
    pub rounds_total: IntCounter,
    pub notify_failures_total: IntCounterVec,
    pub drivers_online: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let orders_total = IntCounterVec::new(
            Opts::new("dispatch_orders_total", "Orders reaching a terminal state"),
            &["outcome"],
        )
        .expect("valid dispatch_orders_total metric");

        let offers_total = IntCounterVec::new(
            Opts::new("dispatch_offers_total", "Offer state transitions"),
            &["state"],
        )
        .expect("valid dispatch_offers_total metric");

        let orders_in_flight = IntGauge::new(
            "dispatch_orders_in_flight",
            "Orders submitted and not yet terminal",
        )
        .expect("valid dispatch_orders_in_flight metric");

        let accept_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "dispatch_accept_latency_seconds",
                "Latency of driver accept handling in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_accept_latency_seconds metric");

        let rounds_total = IntCounter::new("dispatch_rounds_total", "Dispatch rounds executed")
            .expect("valid dispatch_rounds_total metric");

        let notify_failures_total = IntCounterVec::new(
            Opts::new(
                "dispatch_notify_failures_total",
                "Notifier calls that failed or timed out",
            ),
            &["kind"],
        )
        .expect("valid dispatch_notify_failures_total metric");

        let drivers_online = IntGauge::new("drivers_online", "Drivers currently online")
            .expect("valid drivers_online metric");

        registry
            .register(Box::new(orders_total.clone()))
            .expect("register dispatch_orders_total");
        registry
            .register(Box::new(offers_total.clone()))
            .expect("register dispatch_offers_total");
        registry
            .register(Box::new(orders_in_flight.clone()))
            .expect("register dispatch_orders_in_flight");
        registry
            .register(Box::new(accept_latency_seconds.clone()))
            .expect("register dispatch_accept_latency_seconds");
        registry
            .register(Box::new(rounds_total.clone()))
            .expect("register dispatch_rounds_total");
        registry
            .register(Box::new(notify_failures_total.clone()))
            .expect("register dispatch_notify_failures_total");
        registry
            .register(Box::new(drivers_online.clone()))
            .expect("register drivers_online");

        Self {
            registry,
            orders_total,
            offers_total,
            orders_in_flight,
            accept_latency_seconds,
            rounds_total,
            notify_failures_total,
            drivers_online,
        }
    }

    pub fn count_offers(&self, state: &str, n: usize) {
        if n > 0 {
            self.offers_total
                .with_label_values(&[state])
                .inc_by(n as u64);
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labelled_series_show_up_once_touched() {
        let metrics = Metrics::new();
        metrics.orders_total.with_label_values(&["accepted"]).inc();
        metrics.count_offers("superseded", 2);
        metrics.count_offers("timeout", 0);

        let body = metrics.encode().unwrap();
        assert!(body.contains("dispatch_orders_total{outcome=\"accepted\"} 1"));
        assert!(body.contains("dispatch_offers_total{state=\"superseded\"} 2"));
        assert!(!body.contains("state=\"timeout\""));
        assert!(body.contains("dispatch_rounds_total 0"));
    }
}

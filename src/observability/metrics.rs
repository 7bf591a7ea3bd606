use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub claims_total: IntCounterVec,
    pub transitions_total: IntCounterVec,
    pub position_samples_total: IntCounterVec,
    pub active_subscriptions: IntGauge,
    pub stale_ready_orders: IntGauge,
    pub transition_latency_seconds: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let claims_total = IntCounterVec::new(
            Opts::new("claims_total", "Pickup claims by outcome"),
            &["outcome"],
        )
        .expect("valid claims_total metric");

        let transitions_total = IntCounterVec::new(
            Opts::new("transitions_total", "Applied status transitions by target state"),
            &["to"],
        )
        .expect("valid transitions_total metric");

        let position_samples_total = IntCounterVec::new(
            Opts::new("position_samples_total", "Courier position samples by outcome"),
            &["outcome"],
        )
        .expect("valid position_samples_total metric");

        let active_subscriptions = IntGauge::new(
            "active_subscriptions",
            "Currently open customer tracking subscriptions",
        )
        .expect("valid active_subscriptions metric");

        let stale_ready_orders = IntGauge::new(
            "stale_ready_orders",
            "Ready orders unclaimed past the staleness window",
        )
        .expect("valid stale_ready_orders metric");

        let transition_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "transition_latency_seconds",
                "Latency of status transitions in seconds",
            ),
            &["outcome"],
        )
        .expect("valid transition_latency_seconds metric");

        registry
            .register(Box::new(claims_total.clone()))
            .expect("register claims_total");
        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register transitions_total");
        registry
            .register(Box::new(position_samples_total.clone()))
            .expect("register position_samples_total");
        registry
            .register(Box::new(active_subscriptions.clone()))
            .expect("register active_subscriptions");
        registry
            .register(Box::new(stale_ready_orders.clone()))
            .expect("register stale_ready_orders");
        registry
            .register(Box::new(transition_latency_seconds.clone()))
            .expect("register transition_latency_seconds");

        Self {
            registry,
            claims_total,
            transitions_total,
            position_samples_total,
            active_subscriptions,
            stale_ready_orders,
            transition_latency_seconds,
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

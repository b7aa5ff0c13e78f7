//! Prometheus metrics for the serving core.
//!
//! Every component records into one [`Metrics`] instance; an exporter (not
//! provided here) serves [`Metrics::registry`].

use prometheus::{
    register_gauge_vec_with_registry, register_histogram_vec_with_registry,
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry, GaugeVec, Histogram,
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

const NAMESPACE: &str = "llmserve";

pub struct Metrics {
    registry: Registry,

    /// Sequences per phase.
    pub queue_depth: IntGaugeVec,

    /// Submit to first decoded token, per tenant.
    pub ttft: HistogramVec,

    /// Decode throughput per sequence.
    pub decode_tokens_per_sec: Histogram,

    /// Usage / ceiling per budget.
    pub budget_utilization: GaugeVec,

    /// Transfer attempts by transport and outcome.
    pub transfers: IntCounterVec,

    pub transfer_latency: HistogramVec,

    /// Pages demoted or dropped, by source tier.
    pub evictions: IntCounterVec,

    /// Leaked references and stale pins reclaimed.
    pub page_anomalies: IntCounter,

    /// Pages that failed checksum verification.
    pub corrupted_pages: IntCounter,

    pub rejections: IntCounterVec,
    pub preemptions: IntCounter,

    /// Decode gate retries and refusals, by tenant.
    pub rate_limit_events: IntCounterVec,

    /// Prompt tokens served from cached prefix pages.
    pub prefix_hit_tokens: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| Opts::new(name, help).namespace(NAMESPACE);
        let hopts =
            |name: &str, help: &str| HistogramOpts::new(name, help).namespace(NAMESPACE);

        let queue_depth = register_int_gauge_vec_with_registry!(
            opts("sequences", "Sequences by phase"),
            &["phase"],
            registry
        )?;
        let ttft = register_histogram_vec_with_registry!(
            hopts("time_to_first_token_seconds", "Time to first token in seconds").buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0,
            ]),
            &["tenant"],
            registry
        )?;
        let decode_tokens_per_sec = register_histogram_with_registry!(
            hopts("decode_tokens_per_second", "Decode throughput per sequence").buckets(vec![
                10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
            ]),
            registry
        )?;
        let budget_utilization = register_gauge_vec_with_registry!(
            opts("budget_utilization", "Budget usage as a fraction of its ceiling"),
            &["resource"],
            registry
        )?;
        let transfers = register_int_counter_vec_with_registry!(
            opts("transfers_total", "Transfer attempts by transport and outcome"),
            &["transport", "outcome"],
            registry
        )?;
        let transfer_latency = register_histogram_vec_with_registry!(
            hopts("transfer_latency_seconds", "Successful transfer latency").buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0,
            ]),
            &["transport"],
            registry
        )?;
        let evictions = register_int_counter_vec_with_registry!(
            opts("evictions_total", "Pages moved out of a tier"),
            &["tier"],
            registry
        )?;
        let page_anomalies = register_int_counter_with_registry!(
            opts("page_anomalies_total", "Leaked references and stale pins reclaimed"),
            registry
        )?;
        let corrupted_pages = register_int_counter_with_registry!(
            opts("corrupted_pages_total", "Pages failing checksum verification"),
            registry
        )?;
        let rejections = register_int_counter_vec_with_registry!(
            opts("rejections_total", "Rejected sequences by reason"),
            &["reason"],
            registry
        )?;
        let preemptions = register_int_counter_with_registry!(
            opts("preemptions_total", "Sequences preempted back to queue"),
            registry
        )?;
        let rate_limit_events = register_int_counter_vec_with_registry!(
            opts("rate_limit_events_total", "Decode gate retries and refusals"),
            &["tenant", "outcome"],
            registry
        )?;
        let prefix_hit_tokens = register_int_counter_with_registry!(
            opts("prefix_hit_tokens_total", "Prompt tokens served from cached pages"),
            registry
        )?;

        Ok(Self {
            registry,
            queue_depth,
            ttft,
            decode_tokens_per_sec,
            budget_utilization,
            transfers,
            transfer_latency,
            evictions,
            page_anomalies,
            corrupted_pages,
            rejections,
            preemptions,
            rate_limit_events,
            prefix_hit_tokens,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

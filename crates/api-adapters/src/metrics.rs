//! Prometheus metrics exposed on `/metrics`.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub route: String,
    pub status: u16,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub route: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

fn latency_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.005, 2.0, 14))
}

pub struct Metrics {
    registry: Registry,
    pub requests: Family<RequestLabels, Counter>,
    pub latency: Family<RouteLabels, Histogram, fn() -> Histogram>,
    pub offers: Family<OutcomeLabels, Counter>,
    pub leads: Family<OutcomeLabels, Counter>,
    pub pixels_fired: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("offer_engine");

        let requests = Family::<RequestLabels, Counter>::default();
        registry.register("http_requests", "HTTP requests by route and status", requests.clone());

        let latency = Family::<RouteLabels, Histogram, fn() -> Histogram>::new_with_constructor(
            latency_histogram,
        );
        registry.register("http_request_duration_seconds", "HTTP request latency", latency.clone());

        let offers = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "offers",
            "Offers returned by evaluation, admitted or pending",
            offers.clone(),
        );

        let leads = Family::<OutcomeLabels, Counter>::default();
        registry.register("leads", "Lead submissions by status", leads.clone());

        let pixels_fired = Counter::default();
        registry.register("pixels_fired", "Rendered pixels", pixels_fired.clone());

        Self {
            registry,
            requests,
            latency,
            offers,
            leads,
            pixels_fired,
        }
    }

    pub fn count_outcome(family: &Family<OutcomeLabels, Counter>, outcome: &str, n: u64) {
        family
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc_by(n);
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if encode(&mut out, &self.registry).is_err() {
            tracing::warn!("metrics encoding failed");
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_families() {
        let metrics = Metrics::new();
        Metrics::count_outcome(&metrics.leads, "Delivered", 2);
        metrics.pixels_fired.inc();

        let text = metrics.render();
        assert!(text.contains("offer_engine_leads_total{outcome=\"Delivered\"} 2"));
        assert!(text.contains("offer_engine_pixels_fired_total 1"));
    }
}

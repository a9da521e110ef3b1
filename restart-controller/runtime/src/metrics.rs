use crate::http::Outcome;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct HttpMetrics {
    restarts: Family<OutcomeLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: Outcome,
}

// === impl HttpMetrics ===

impl HttpMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "requests",
            "Total number of restart requests by outcome",
            metrics.restarts.clone(),
        );
        metrics
    }

    pub(crate) fn observe(&self, outcome: Outcome) {
        self.restarts.get_or_create(&OutcomeLabels { outcome }).inc();
    }

    #[cfg(test)]
    pub(crate) fn count(&self, outcome: Outcome) -> u64 {
        self.restarts.get_or_create(&OutcomeLabels { outcome }).get()
    }
}

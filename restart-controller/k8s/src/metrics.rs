use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct WatchMetrics {
    updates: Counter,
    rejected: Counter,
    restarts: Counter,
    tokens: Gauge,
}

// === impl WatchMetrics ===

impl WatchMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();

        reg.register(
            "token_secret_updates",
            "Total number of token secret versions published to the token store",
            metrics.updates.clone(),
        );
        reg.register(
            "token_secret_rejected",
            "Total number of token secret versions rejected because they could not be decoded",
            metrics.rejected.clone(),
        );
        reg.register(
            "token_watch_restarts",
            "Total number of times the token secret watch was re-established",
            metrics.restarts.clone(),
        );
        reg.register(
            "tokens",
            "Number of deployments with a registered token",
            metrics.tokens.clone(),
        );

        metrics
    }

    pub(crate) fn published(&self, tokens: usize) {
        self.updates.inc();
        self.tokens.set(tokens as i64);
    }

    pub(crate) fn rejected(&self) {
        self.rejected.inc();
    }

    pub(crate) fn restarted(&self) {
        self.restarts.inc();
    }

    #[cfg(test)]
    pub(crate) fn update_count(&self) -> u64 {
        self.updates.get()
    }

    #[cfg(test)]
    pub(crate) fn rejected_count(&self) -> u64 {
        self.rejected.get()
    }

    #[cfg(test)]
    pub(crate) fn restart_count(&self) -> u64 {
        self.restarts.get()
    }
}

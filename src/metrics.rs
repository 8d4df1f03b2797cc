//! Prometheus metrics for ClassHub.
//!
//! Exposed on `/metrics`. All metrics live in the global default registry
//! and are registered once, on first use.

use once_cell::sync::Lazy;
use prometheus::{opts, register_counter_vec, register_int_counter, CounterVec, Encoder, IntCounter, TextEncoder};

use crate::store::Operation;

pub struct Metrics {
    permission_errors_total: CounterVec,
    chat_requests_total: CounterVec,
    feed_deliveries_total: IntCounter,
}

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::register);

/// Process-wide recorder.
pub fn global() -> &'static Metrics {
    &METRICS
}

impl Metrics {
    fn register() -> Self {
        let permission_errors_total = register_counter_vec!(
            opts!(
                "classhub_permission_errors_total",
                "Store operations rejected for insufficient permissions"
            ),
            &["operation"]
        )
        .expect("failed to register classhub_permission_errors_total");

        let chat_requests_total = register_counter_vec!(
            opts!("classhub_chat_requests_total", "Chat assistant turns by outcome"),
            &["assistant", "outcome"]
        )
        .expect("failed to register classhub_chat_requests_total");

        let feed_deliveries_total = register_int_counter!(
            "classhub_feed_deliveries_total",
            "Notification snapshots applied to a feed"
        )
        .expect("failed to register classhub_feed_deliveries_total");

        Self {
            permission_errors_total,
            chat_requests_total,
            feed_deliveries_total,
        }
    }

    pub fn permission_error(&self, operation: Operation) {
        self.permission_errors_total
            .with_label_values(&[operation.as_str()])
            .inc();
    }

    /// `outcome` is one of `ok`, `empty`, `fallback`.
    pub fn chat_request(&self, assistant: &str, outcome: &str) {
        self.chat_requests_total
            .with_label_values(&[assistant, outcome])
            .inc();
    }

    pub fn feed_delivery(&self) {
        self.feed_deliveries_total.inc();
    }
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> String {
    // Make sure our own series exist even before the first event.
    Lazy::force(&METRICS);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_series() {
        global().permission_error(Operation::Update);
        global().chat_request("general", "ok");
        let text = render();
        assert!(text.contains("classhub_permission_errors_total"));
        assert!(text.contains("classhub_chat_requests_total"));
        assert!(text.contains("classhub_feed_deliveries_total"));
    }
}

//! Prometheus metrics for the MQ server
//!
//! Provides observability into message throughput, retries, dead letters and
//! control-loop health.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. Returns `false` if
/// another global recorder was already installed.
pub fn init_metrics() -> bool {
    let result = PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
    });

    match result {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn get_metrics_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    get_metrics_handle().map(|h| h.render()).unwrap_or_default()
}

/// Per-queue metrics helper, one per worker
#[derive(Debug, Clone)]
pub struct MqMetrics {
    /// Queue name for labeling
    queue: String,
    /// Message type for labeling
    type_name: String,
}

impl MqMetrics {
    pub fn new(queue: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            type_name: type_name.into(),
        }
    }

    pub fn message_received(&self) {
        counter!(
            "mq_messages_received_total",
            "queue" => self.queue.clone(),
            "type" => self.type_name.clone()
        )
        .increment(1);
    }

    pub fn message_processed(&self, duration: Duration) {
        counter!(
            "mq_messages_processed_total",
            "queue" => self.queue.clone(),
            "type" => self.type_name.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "mq_message_duration_seconds",
            "queue" => self.queue.clone(),
            "type" => self.type_name.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn message_failed(&self, error_code: &str) {
        counter!(
            "mq_messages_processed_total",
            "queue" => self.queue.clone(),
            "type" => self.type_name.clone(),
            "status" => "failed"
        )
        .increment(1);

        counter!(
            "mq_message_errors_total",
            "type" => self.type_name.clone(),
            "error_code" => error_code.to_string()
        )
        .increment(1);
    }

    pub fn message_retried(&self) {
        counter!(
            "mq_messages_retried_total",
            "queue" => self.queue.clone(),
            "type" => self.type_name.clone()
        )
        .increment(1);
    }

    pub fn message_dead_lettered(&self) {
        counter!(
            "mq_messages_dlq_total",
            "type" => self.type_name.clone()
        )
        .increment(1);
    }

    pub fn notification(&self) {
        counter!(
            "mq_worker_notifications_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    pub fn worker_restarted(&self) {
        counter!(
            "mq_worker_restarts_total",
            "queue" => self.queue.clone(),
            "type" => self.type_name.clone()
        )
        .increment(1);
    }
}

/// Record a control-loop failure
pub fn server_error() {
    counter!("mq_server_errors_total").increment(1);
}

/// Record a control-loop (re)start
pub fn server_started() {
    counter!("mq_server_starts_total").increment(1);
}

/// Update the running worker gauge
pub fn workers_running(count: usize) {
    gauge!("mq_workers_running").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = MqMetrics::new("mq:Hello.inq", "Hello");
        assert_eq!(metrics.queue, "mq:Hello.inq");
        assert_eq!(metrics.type_name, "Hello");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = MqMetrics::new("mq:Hello.inq", "Hello");
        metrics.message_received();
        metrics.message_processed(Duration::from_millis(5));
        metrics.message_failed("HandlerError");
        server_error();
    }
}

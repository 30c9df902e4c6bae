use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Admitted,
    Skipped,
    Bypassed,
    Error,
}

impl CheckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckOutcome::Admitted => "admitted",
            CheckOutcome::Skipped => "skipped",
            CheckOutcome::Bypassed => "bypassed",
            CheckOutcome::Error => "error",
        }
    }
}

/// Outcome of a marker write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerOutcome {
    Recorded,
    Skipped,
    Failed,
}

impl MarkerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerOutcome::Recorded => "recorded",
            MarkerOutcome::Skipped => "skipped",
            MarkerOutcome::Failed => "failed",
        }
    }
}

/// Metrics recorder facade for the idempotency layer.
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_check(&self, listener: &str, outcome: CheckOutcome) {
        counter!("idempotency_checks_total", "listener" => listener.to_string(), "outcome" => outcome.as_str()).increment(1);
    }

    pub fn record_marker(&self, listener: &str, outcome: MarkerOutcome) {
        counter!("idempotency_markers_total", "listener" => listener.to_string(), "outcome" => outcome.as_str()).increment(1);
    }

    pub fn record_store_operation(&self, operation: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_store_operations_total", "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_store_duration_ms", "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_kafka_message(&self, topic: &str, success: bool) {
        counter!("kafka_messages_total", "topic" => topic.to_string(), "success" => success.to_string()).increment(1);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
///
/// Concurrent first calls serialize on the install; later calls return the
/// stored handle.
pub fn init_metrics() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let _guard = INSTALL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    METRICS.get_or_init(Metrics::new);

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!("idempotency_checks_total", Unit::Count, "Admission checks by outcome");
    describe_counter!("idempotency_markers_total", Unit::Count, "Idempotency marker writes by outcome");
    describe_counter!("idempotency_store_operations_total", Unit::Count, "Store operations by success");
    describe_histogram!("idempotency_store_duration_ms", Unit::Milliseconds, "Store operation latency in milliseconds");
    describe_counter!("kafka_messages_total", Unit::Count, "Total Kafka messages dispatched to listeners");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

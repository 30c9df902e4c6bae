use crate::config::{IdempotencySettings, ListenerSettings, Settings};
use crate::error::{IdempotencyError, Result};
use crate::idempotency::identity::{extract_identity, IdentityParameter, IdentityValue, RecordIdentity};
use crate::idempotency::storage::{IdempotencyStore, KeyNamespace, RedisIdempotencyStore};
use crate::observability::metrics::{get_metrics, CheckOutcome, MarkerOutcome};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// In-process counters of guard decisions.
#[derive(Debug, Default)]
pub struct GuardStats {
    pub admitted: AtomicU64,
    pub skipped: AtomicU64,
    pub bypassed: AtomicU64,
    pub check_errors: AtomicU64,
    pub markers_recorded: AtomicU64,
    pub marker_failures: AtomicU64,
}

impl GuardStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_check(&self, outcome: CheckOutcome) {
        let counter = match outcome {
            CheckOutcome::Admitted => &self.admitted,
            CheckOutcome::Skipped => &self.skipped,
            CheckOutcome::Bypassed => &self.bypassed,
            CheckOutcome::Error => &self.check_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_marker(&self, outcome: MarkerOutcome) {
        match outcome {
            MarkerOutcome::Recorded => {
                self.markers_recorded.fetch_add(1, Ordering::Relaxed);
            }
            MarkerOutcome::Failed => {
                self.marker_failures.fetch_add(1, Ordering::Relaxed);
            }
            MarkerOutcome::Skipped => {}
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            check_errors: self.check_errors.load(Ordering::Relaxed),
            markers_recorded: self.markers_recorded.load(Ordering::Relaxed),
            marker_failures: self.marker_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub admitted: u64,
    pub skipped: u64,
    pub bypassed: u64,
    pub check_errors: u64,
    pub markers_recorded: u64,
    pub marker_failures: u64,
}

impl StatsSnapshot {
    pub fn duplicate_rate(&self) -> f64 {
        let checked = self.admitted + self.skipped;
        if checked == 0 {
            0.0
        } else {
            self.skipped as f64 / checked as f64
        }
    }
}

/// Decision of the admission phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Invoke the handler.
    Admit,
    /// Already processed; do not invoke the handler.
    Skip,
}

/// Per-handler registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerOptions {
    /// Used as the log location and metrics label.
    pub name: String,
    /// Marker TTL override in seconds; `<= 0` uses the configured default.
    pub ttl_seconds: i64,
}

impl ListenerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl_seconds: 0,
        }
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }
}

/// A positive override wins, anything else falls back to the default.
pub fn select_ttl(ttl_override: i64, default_ttl: Duration) -> Duration {
    if ttl_override <= 0 {
        default_ttl
    } else {
        Duration::from_secs(ttl_override as u64)
    }
}

/// Runs the check-then-record protocol around listener invocations.
///
/// The admission phase consults the store before the handler runs; its errors
/// are surfaced as `CheckFailure` unless `suppress_errors` is set, in which case
/// the message is admitted. The persistence phase runs only after the handler
/// succeeded and never fails: the handler's side effects are already committed.
#[derive(Clone)]
pub struct IdempotencyGuard {
    enabled: bool,
    settings: ListenerSettings,
    store: Arc<dyn IdempotencyStore>,
    stats: Arc<GuardStats>,
}

impl IdempotencyGuard {
    pub fn new(settings: &IdempotencySettings, store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            enabled: settings.enabled,
            settings: settings.listener.clone(),
            store,
            stats: Arc::new(GuardStats::new()),
        }
    }

    /// Builds a guard backed by Redis, keyed by the Kafka consumer group.
    pub async fn connect_redis(settings: &Settings) -> Result<Self> {
        let namespace = KeyNamespace::from_settings(&settings.idempotency, &settings.kafka.group_id);
        let store = RedisIdempotencyStore::open(&settings.redis.url, namespace)?;
        store.ping().await?;
        info!(
            group_id = %settings.kafka.group_id,
            key_prefix = %store.namespace().prefix(),
            "Idempotency store connected"
        );
        Ok(Self::new(&settings.idempotency, Arc::new(store)))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    pub fn stats(&self) -> Arc<GuardStats> {
        Arc::clone(&self.stats)
    }

    /// Admission phase.
    pub async fn check<F>(&self, location: &str, identity: F) -> Result<Admission>
    where
        F: FnOnce() -> Result<RecordIdentity>,
    {
        if !self.enabled || !self.settings.check_enabled {
            debug!(location, "Idempotency check is disabled, admitting record");
            self.note_check(location, CheckOutcome::Bypassed);
            return Ok(Admission::Admit);
        }

        match self.lookup(identity).await {
            Ok((record_id, true)) => {
                debug!(
                    location,
                    identity = %record_id,
                    "Listener invocation skipped, record was already processed"
                );
                self.note_check(location, CheckOutcome::Skipped);
                Ok(Admission::Skip)
            }
            Ok((_, false)) => {
                self.note_check(location, CheckOutcome::Admitted);
                Ok(Admission::Admit)
            }
            Err(err) => {
                error!(location, error = %err, "Could not look up the idempotency information");
                self.note_check(location, CheckOutcome::Error);
                if self.settings.suppress_errors {
                    warn!(location, "Idempotency errors are suppressed, admitting record without duplicate protection");
                    Ok(Admission::Admit)
                } else {
                    Err(IdempotencyError::CheckFailure(Box::new(err)))
                }
            }
        }
    }

    /// Persistence phase. Failures are logged and swallowed regardless of `suppress_errors`.
    pub async fn persist<F>(&self, location: &str, ttl_override: i64, identity: F) -> MarkerOutcome
    where
        F: FnOnce() -> Result<RecordIdentity>,
    {
        let outcome = self.write_marker(location, ttl_override, identity).await;
        self.stats.record_marker(outcome);
        get_metrics().record_marker(location, outcome);
        outcome
    }

    /// Runs `handler` under the guard. Returns `Ok(None)` when the record was skipped.
    ///
    /// Handler errors propagate unchanged and no marker is written for them.
    pub async fn execute<T, I, F, Fut>(
        &self,
        options: &ListenerOptions,
        identity: I,
        handler: F,
    ) -> Result<Option<T>>
    where
        I: Fn() -> Result<RecordIdentity>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.check(&options.name, &identity).await? == Admission::Skip {
            return Ok(None);
        }

        let value = handler().await?;
        self.persist(&options.name, options.ttl_seconds, &identity).await;
        Ok(Some(value))
    }

    /// Like [`execute`](Self::execute), deriving the identity from an argument list
    /// and its parallel parameter metadata.
    pub async fn execute_with_arguments<T, F, Fut>(
        &self,
        options: &ListenerOptions,
        arguments: &[IdentityValue],
        parameters: &[IdentityParameter],
        handler: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute(options, || extract_identity(arguments, parameters), handler)
            .await
    }

    async fn lookup<F>(&self, identity: F) -> Result<(RecordIdentity, bool)>
    where
        F: FnOnce() -> Result<RecordIdentity>,
    {
        let record_id = identity()?;
        let exists = self.store.exists(&record_id).await?;
        Ok((record_id, exists))
    }

    async fn write_marker<F>(&self, location: &str, ttl_override: i64, identity: F) -> MarkerOutcome
    where
        F: FnOnce() -> Result<RecordIdentity>,
    {
        if !self.enabled || !self.settings.persistence_enabled {
            debug!(location, "Saving idempotency markers is disabled, skipping");
            return MarkerOutcome::Skipped;
        }

        let record_id = match identity() {
            Ok(record_id) => record_id,
            Err(err) => {
                error!(location, error = %err, "Could not derive the record identity, no idempotency marker saved");
                return MarkerOutcome::Skipped;
            }
        };

        let ttl = select_ttl(ttl_override, self.settings.ttl);
        match self.store.record(&record_id, ttl).await {
            Ok(()) => {
                debug!(location, identity = %record_id, ttl_secs = ttl.as_secs(), "Idempotency marker saved");
                MarkerOutcome::Recorded
            }
            Err(err) => {
                error!(location, identity = %record_id, error = %err, "Could not save idempotency marker for the record");
                MarkerOutcome::Failed
            }
        }
    }

    fn note_check(&self, location: &str, outcome: CheckOutcome) {
        self.stats.record_check(outcome);
        get_metrics().record_check(location, outcome);
    }
}

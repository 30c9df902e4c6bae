use crate::config::IdempotencySettings;
use crate::error::{IdempotencyError, Result};
use crate::idempotency::identity::RecordIdentity;
use crate::observability::metrics::{get_metrics, LatencyTimer};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Delimiter between the key prefix, the consumer group and the record identity.
pub const KEY_DELIMITER: &str = "_";

/// Presence, not value, carries meaning.
const MARKER_VALUE: &str = "1";

/// Capability contract of a TTL-expiring key existence store.
///
/// There is no atomic check-and-set: two concurrent deliveries of the same
/// identity may both observe `exists == false` before either records a marker.
/// Only markers written before the check runs prevent a duplicate.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Whether a marker for `identity` is currently recorded.
    async fn exists(&self, identity: &RecordIdentity) -> Result<bool>;

    /// Inserts or overwrites the marker for `identity`; the last TTL wins.
    async fn record(&self, identity: &RecordIdentity, ttl: Duration) -> Result<()>;
}

/// Key namespace of one consumer group: `{prefix}_{group}_`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    pub fn new(key_prefix: &str, consumer_group_id: &str) -> Self {
        Self {
            prefix: format!(
                "{}{}{}{}",
                key_prefix, KEY_DELIMITER, consumer_group_id, KEY_DELIMITER
            ),
        }
    }

    pub fn from_settings(settings: &IdempotencySettings, consumer_group_id: &str) -> Self {
        Self::new(&settings.listener.key_prefix, consumer_group_id)
    }

    pub fn key_for(&self, identity: &RecordIdentity) -> String {
        identity.with_prefix(&self.prefix)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Redis-backed marker store using `EXISTS` and `SET key 1 EX ttl`.
pub struct RedisIdempotencyStore {
    client: redis::Client,
    namespace: KeyNamespace,
}

impl RedisIdempotencyStore {
    pub fn new(client: redis::Client, namespace: KeyNamespace) -> Self {
        Self { client, namespace }
    }

    pub fn open(url: &str, namespace: KeyNamespace) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    /// Sends a `PING`, used at startup to fail fast on a misconfigured URL.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn query_exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn set_marker(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.set_ex(key, MARKER_VALUE, ttl_seconds).await?;
        Ok(())
    }

    /// Redis rejects a zero expiry.
    fn ttl_seconds(ttl: Duration) -> u64 {
        let secs = ttl.as_secs();
        if ttl.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn exists(&self, identity: &RecordIdentity) -> Result<bool> {
        let timer = LatencyTimer::new();
        let result = self.query_exists(&self.namespace.key_for(identity)).await;
        get_metrics().record_store_operation("exists", timer.elapsed_ms(), result.is_ok());
        result
    }

    async fn record(&self, identity: &RecordIdentity, ttl: Duration) -> Result<()> {
        let timer = LatencyTimer::new();
        let result = self
            .set_marker(&self.namespace.key_for(identity), Self::ttl_seconds(ttl))
            .await;
        get_metrics().record_store_operation("record", timer.elapsed_ms(), result.is_ok());
        result
    }
}

/// Marker count at which `record` first sweeps expired entries.
pub const DEFAULT_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug)]
struct MarkerTable {
    entries: HashMap<String, Instant>,
    prune_at: usize,
}

impl MarkerTable {
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        before - self.entries.len()
    }
}

/// Process-local marker store with per-key expiry.
///
/// Expired markers read as absent. They are dropped when their key is checked
/// again, and swept in bulk by `record` whenever the table reaches its prune
/// threshold; the threshold then doubles over the live count.
#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    namespace: KeyNamespace,
    prune_threshold: usize,
    markers: RwLock<MarkerTable>,
}

impl InMemoryIdempotencyStore {
    pub fn new(namespace: KeyNamespace) -> Self {
        Self::with_prune_threshold(namespace, DEFAULT_PRUNE_THRESHOLD)
    }

    pub fn with_prune_threshold(namespace: KeyNamespace, prune_threshold: usize) -> Self {
        let prune_threshold = prune_threshold.max(1);
        Self {
            namespace,
            prune_threshold,
            markers: RwLock::new(MarkerTable {
                entries: HashMap::new(),
                prune_at: prune_threshold,
            }),
        }
    }

    /// Number of markers that have not yet expired.
    pub async fn live_markers(&self) -> usize {
        let now = Instant::now();
        let markers = self.markers.read().await;
        markers.entries.values().filter(|expiry| **expiry > now).count()
    }

    /// Number of entries held, expired or not.
    pub async fn held_markers(&self) -> usize {
        self.markers.read().await.entries.len()
    }

    /// Removes expired markers, returning how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        self.markers.write().await.sweep(Instant::now())
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(KeyNamespace::new("", ""))
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn exists(&self, identity: &RecordIdentity) -> Result<bool> {
        let key = self.namespace.key_for(identity);
        let expired = {
            let markers = self.markers.read().await;
            match markers.entries.get(&key) {
                Some(expiry) if *expiry > Instant::now() => return Ok(true),
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut markers = self.markers.write().await;
            if let Some(expiry) = markers.entries.get(&key) {
                if *expiry <= Instant::now() {
                    markers.entries.remove(&key);
                }
            }
        }
        Ok(false)
    }

    async fn record(&self, identity: &RecordIdentity, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(IdempotencyError::Validation(
                "marker TTL must be positive".to_string(),
            ));
        }
        let now = Instant::now();
        let expiry = now.checked_add(ttl).ok_or_else(|| {
            IdempotencyError::Validation(format!(
                "marker TTL of {}s is out of range",
                ttl.as_secs()
            ))
        })?;

        let key = self.namespace.key_for(identity);
        let mut markers = self.markers.write().await;
        if markers.entries.len() >= markers.prune_at {
            let dropped = markers.sweep(now);
            markers.prune_at = self.prune_threshold.max(markers.entries.len() * 2);
            debug!(dropped, held = markers.entries.len(), "Swept expired idempotency markers");
        }
        markers.entries.insert(key, expiry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> RecordIdentity {
        RecordIdentity::new([id]).unwrap()
    }

    #[test]
    fn test_key_namespace_format() {
        let namespace = KeyNamespace::new("kafkaidmp", "orders-consumer");
        assert_eq!(
            namespace.key_for(&identity("1c9bb6f0")),
            "kafkaidmp_orders-consumer_1c9bb6f0"
        );
    }

    #[test]
    fn test_key_namespace_empty_prefix() {
        let namespace = KeyNamespace::new("", "group");
        assert_eq!(namespace.prefix(), "_group_");
        assert_eq!(namespace.key_for(&identity("a-b")), "_group_a-b");
    }

    #[test]
    fn test_redis_ttl_rounding() {
        assert_eq!(RedisIdempotencyStore::ttl_seconds(Duration::from_secs(60)), 60);
        assert_eq!(RedisIdempotencyStore::ttl_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(RedisIdempotencyStore::ttl_seconds(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_in_memory_record_then_exists() {
        let store = InMemoryIdempotencyStore::default();
        let id = identity("topicA-message1");

        assert!(!store.exists(&id).await.unwrap());
        store.record(&id, Duration::from_secs(60)).await.unwrap();
        assert!(store.exists(&id).await.unwrap());
        assert_eq!(store.live_markers().await, 1);
    }

    #[tokio::test]
    async fn test_in_memory_namespaces_are_isolated() {
        let a = InMemoryIdempotencyStore::new(KeyNamespace::new("p", "group-a"));
        let id = identity("x");
        a.record(&id, Duration::from_secs(60)).await.unwrap();

        assert_eq!(a.namespace.key_for(&id), "p_group-a_x");
        assert!(a.markers.read().await.entries.contains_key("p_group-a_x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_marker_expires() {
        let store = InMemoryIdempotencyStore::default();
        let id = identity("expiring");
        store.record(&id, Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.exists(&id).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.exists(&id).await.unwrap());
        assert_eq!(store.live_markers().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_last_ttl_wins() {
        let store = InMemoryIdempotencyStore::default();
        let id = identity("overwrite");
        store.record(&id, Duration::from_secs(100)).await.unwrap();
        store.record(&id, Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.exists(&id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_purge_expired() {
        let store = InMemoryIdempotencyStore::default();
        store.record(&identity("short"), Duration::from_secs(1)).await.unwrap();
        store.record(&identity("long"), Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.live_markers().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_record_sweeps_at_threshold() {
        let store = InMemoryIdempotencyStore::with_prune_threshold(KeyNamespace::new("", "g"), 100);
        for i in 0..100 {
            store.record(&identity(&format!("old-{}", i)), Duration::from_secs(1)).await.unwrap();
        }
        assert_eq!(store.held_markers().await, 100);

        tokio::time::advance(Duration::from_secs(10)).await;
        store.record(&identity("fresh"), Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.held_markers().await, 1);
        assert!(store.exists(&identity("fresh")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_threshold_grows_over_live_markers() {
        let store = InMemoryIdempotencyStore::with_prune_threshold(KeyNamespace::new("", "g"), 4);
        for i in 0..9 {
            store.record(&identity(&format!("live-{}", i)), Duration::from_secs(60)).await.unwrap();
        }

        assert_eq!(store.held_markers().await, 9);
        assert_eq!(store.markers.read().await.prune_at, 16);
    }

    #[tokio::test]
    async fn test_in_memory_rejects_unrepresentable_ttl() {
        let store = InMemoryIdempotencyStore::default();
        let err = store
            .record(&identity("forever"), Duration::from_secs(u64::MAX))
            .await
            .unwrap_err();

        assert!(matches!(err, IdempotencyError::Validation(_)));
        assert_eq!(store.held_markers().await, 0);
    }
}

use crate::config::KafkaSettings;
use crate::error::{IdempotencyError, Result};
use crate::observability::metrics::get_metrics;
use async_trait::async_trait;
use rskafka::client::partition::{Compression, OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::ClientBuilder;
use rskafka::record::{Record, RecordAndOffset};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Configuration for the Kafka consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub brokers: Vec<String>,
    pub topics: Vec<String>,
    pub group_id: String,
    pub partition: i32,
    pub auto_offset_reset: OffsetReset,
    pub fetch_max_wait_ms: i32,
    pub max_poll_records: usize,
    /// Pause before redelivering a message whose handler failed.
    pub redelivery_backoff: Duration,
    /// Attempts before a failing message is parked; 0 retries forever.
    pub max_delivery_attempts: u32,
    pub dead_letter_topic: Option<String>,
}

/// Where a topic without a stored offset starts consuming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    /// Broker-side position the initial offset is resolved against.
    pub fn offset_at(&self) -> OffsetAt {
        match self {
            OffsetReset::Earliest => OffsetAt::Earliest,
            OffsetReset::Latest => OffsetAt::Latest,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            topics: Vec::new(),
            group_id: "listener-idempotency".to_string(),
            partition: 0,
            auto_offset_reset: OffsetReset::default(),
            fetch_max_wait_ms: 500,
            max_poll_records: 100,
            redelivery_backoff: Duration::from_secs(1),
            max_delivery_attempts: 0,
            dead_letter_topic: None,
        }
    }
}

impl From<&KafkaSettings> for ConsumerConfig {
    fn from(settings: &KafkaSettings) -> Self {
        Self {
            brokers: settings.brokers.clone(),
            topics: settings.topics.clone(),
            group_id: settings.group_id.clone(),
            fetch_max_wait_ms: settings.fetch_max_wait_ms,
            max_poll_records: settings.max_poll_records,
            ..Self::default()
        }
    }
}

/// Message received from Kafka.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, Vec<u8>>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ConsumedMessage {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: value.into(),
            headers: BTreeMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Deserializes the message value as JSON.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.value).map_err(|e| {
            IdempotencyError::Validation(format!("Failed to deserialize message: {}", e))
        })
    }

    /// Gets the key as a string.
    pub fn key_str(&self) -> Option<String> {
        self.key.as_ref().and_then(|k| String::from_utf8(k.clone()).ok())
    }

    /// Gets a header value as a string.
    pub fn header_str(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    fn from_record(topic: &str, partition: i32, r: RecordAndOffset) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            offset: r.offset,
            key: r.record.key,
            value: r.record.value.unwrap_or_default(),
            headers: r.record.headers,
            timestamp: r.record.timestamp,
        }
    }
}

/// Handler trait for processing consumed messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes a single message. An error leaves the message to be redelivered.
    async fn handle(&self, message: &ConsumedMessage) -> Result<()>;

    /// Called when a message exhausted its delivery attempts.
    async fn on_dead_letter(&self, message: &ConsumedMessage, error: &IdempotencyError) {
        error!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            error = %error,
            "Message parked after exhausting delivery attempts"
        );
    }
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, message: &ConsumedMessage) -> Result<()> {
        (**self).handle(message).await
    }

    async fn on_dead_letter(&self, message: &ConsumedMessage, error: &IdempotencyError) {
        (**self).on_dead_letter(message, error).await
    }
}

/// What the consumer does after a handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDecision {
    /// Advance past the message.
    Commit,
    /// Keep the offset; the message is fetched again on the next poll.
    Redeliver,
    /// Give up on the message and advance past it.
    Park,
}

/// Decides what to do after the `attempt`-th delivery of a message failed.
pub fn decide_after_failure(attempt: u32, max_delivery_attempts: u32) -> DeliveryDecision {
    if max_delivery_attempts > 0 && attempt >= max_delivery_attempts {
        DeliveryDecision::Park
    } else {
        DeliveryDecision::Redeliver
    }
}

/// Kafka consumer dispatching records to a message handler.
pub struct EventConsumer {
    config: ConsumerConfig,
    client: Option<Arc<rskafka::client::Client>>,
    partition_clients: Arc<RwLock<BTreeMap<String, Arc<PartitionClient>>>>,
    offsets: Arc<RwLock<BTreeMap<String, AtomicI64>>>,
    attempts: Arc<RwLock<BTreeMap<String, (i64, u32)>>>,
    running: Arc<AtomicBool>,
}

impl EventConsumer {
    /// Creates a new event consumer with the given configuration.
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            client: None,
            partition_clients: Arc::new(RwLock::new(BTreeMap::new())),
            offsets: Arc::new(RwLock::new(BTreeMap::new())),
            attempts: Arc::new(RwLock::new(BTreeMap::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connects to the Kafka cluster.
    pub async fn connect(&mut self) -> Result<()> {
        info!(brokers = ?self.config.brokers, "Connecting consumer to Kafka");

        let client = ClientBuilder::new(self.config.brokers.clone()).build().await?;
        self.client = Some(Arc::new(client));

        for topic in &self.config.topics {
            self.get_partition_client(topic).await?;
        }

        info!(group_id = %self.config.group_id, "Consumer connected to Kafka");
        Ok(())
    }

    /// Gets or creates a partition client for the given topic.
    async fn get_partition_client(&self, topic: &str) -> Result<Arc<PartitionClient>> {
        {
            let clients = self.partition_clients.read().await;
            if let Some(client) = clients.get(topic) {
                return Ok(client.clone());
            }
        }

        let kafka_client = self.client.as_ref().ok_or_else(|| {
            IdempotencyError::Validation("Kafka client not connected".to_string())
        })?;

        let partition_client = kafka_client
            .partition_client(topic.to_string(), self.config.partition, UnknownTopicHandling::Retry)
            .await?;
        let client = Arc::new(partition_client);

        if !self.offsets.read().await.contains_key(topic) {
            let at = self.config.auto_offset_reset.offset_at();
            let initial_offset = client.get_offset(at).await?;
            debug!(topic, initial_offset, "Seeded consumer offset");
            self.offsets
                .write()
                .await
                .entry(topic.to_string())
                .or_insert_with(|| AtomicI64::new(initial_offset));
        }

        {
            let mut clients = self.partition_clients.write().await;
            clients.insert(topic.to_string(), client.clone());
        }

        Ok(client)
    }

    async fn get_offset(&self, topic: &str) -> i64 {
        let offsets = self.offsets.read().await;
        offsets
            .get(topic)
            .map(|o| o.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    async fn update_offset(&self, topic: &str, offset: i64) {
        let offsets = self.offsets.read().await;
        if let Some(o) = offsets.get(topic) {
            o.store(offset, Ordering::SeqCst);
        }
    }

    /// Fetches records at the current offset without advancing it.
    pub async fn poll(&self, topic: &str) -> Result<Vec<ConsumedMessage>> {
        let partition_client = self.get_partition_client(topic).await?;
        let current_offset = self.get_offset(topic).await;

        let (records, _high_watermark) = partition_client
            .fetch_records(current_offset, 1..1_000_000, self.config.fetch_max_wait_ms)
            .await?;

        let partition = self.config.partition;
        let messages: Vec<ConsumedMessage> = records
            .into_iter()
            .take(self.config.max_poll_records)
            .map(|r| ConsumedMessage::from_record(topic, partition, r))
            .collect();

        debug!(topic, count = messages.len(), "Polled messages");
        Ok(messages)
    }

    /// Dispatches polled messages in order, stopping at the first one that must be redelivered.
    ///
    /// Returns `Park` when any message of the batch was given up on.
    pub async fn dispatch<H: MessageHandler + ?Sized>(
        &self,
        topic: &str,
        messages: Vec<ConsumedMessage>,
        handler: &H,
    ) -> DeliveryDecision {
        let mut outcome = DeliveryDecision::Commit;
        for message in messages {
            let decision = match handler.handle(&message).await {
                Ok(()) => {
                    get_metrics().record_kafka_message(topic, true);
                    debug!(topic, offset = message.offset, "Processed message");
                    DeliveryDecision::Commit
                }
                Err(e) => {
                    get_metrics().record_kafka_message(topic, false);
                    let attempt = self.note_failed_attempt(topic, message.offset).await;
                    error!(topic, offset = message.offset, attempt, error = %e, "Failed to process message");

                    let decision = decide_after_failure(attempt, self.config.max_delivery_attempts);
                    if decision == DeliveryDecision::Park {
                        handler.on_dead_letter(&message, &e).await;
                        if let Some(dlq_topic) = &self.config.dead_letter_topic {
                            if let Err(dlq_err) = self.send_to_dlq(dlq_topic, &message).await {
                                error!(error = %dlq_err, "Failed to send message to DLQ");
                            }
                        }
                    }
                    decision
                }
            };

            match decision {
                DeliveryDecision::Redeliver => return decision,
                DeliveryDecision::Park => outcome = decision,
                DeliveryDecision::Commit => {}
            }
            self.attempts.write().await.remove(topic);
            self.update_offset(topic, message.offset + 1).await;
        }
        outcome
    }

    async fn note_failed_attempt(&self, topic: &str, offset: i64) -> u32 {
        let mut attempts = self.attempts.write().await;
        let entry = attempts.entry(topic.to_string()).or_insert((offset, 0));
        if entry.0 != offset {
            *entry = (offset, 0);
        }
        entry.1 += 1;
        entry.1
    }

    /// Starts consuming messages with the given handler.
    pub async fn start<H: MessageHandler + 'static>(&self, handler: Arc<H>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(topics = ?self.config.topics, "Starting consumer");

        while self.running.load(Ordering::SeqCst) {
            let mut backoff = false;
            for topic in &self.config.topics {
                let messages = match self.poll(topic).await {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Failed to poll topic");
                        continue;
                    }
                };
                if self.dispatch(topic, messages, handler.as_ref()).await == DeliveryDecision::Redeliver {
                    backoff = true;
                }
            }

            if backoff {
                tokio::time::sleep(self.config.redelivery_backoff).await;
            } else {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        info!("Consumer stopped");
        Ok(())
    }

    async fn send_to_dlq(&self, dlq_topic: &str, message: &ConsumedMessage) -> Result<()> {
        let partition_client = self.get_partition_client(dlq_topic).await?;

        let mut headers = message.headers.clone();
        headers.insert("original_topic".to_string(), message.topic.as_bytes().to_vec());
        headers.insert("original_offset".to_string(), message.offset.to_string().into_bytes());

        let record = Record {
            key: message.key.clone(),
            value: Some(message.value.clone()),
            headers,
            timestamp: chrono::Utc::now(),
        };

        partition_client
            .produce(vec![record], Compression::NoCompression)
            .await?;

        warn!(dlq_topic, "Message sent to DLQ");
        Ok(())
    }

    /// Stops the consumer.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Consumer stop requested");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }
}

#![allow(dead_code)]

use async_trait::async_trait;
use listener_idempotency::config::IdempotencySettings;
use listener_idempotency::error::{IdempotencyError, Result};
use listener_idempotency::events::{ConsumedMessage, MessageHandler};
use listener_idempotency::idempotency::{IdempotencyStore, RecordIdentity};
use mockall::mock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

mock! {
    pub Store {}

    #[async_trait]
    impl IdempotencyStore for Store {
        async fn exists(&self, identity: &RecordIdentity) -> Result<bool>;
        async fn record(&self, identity: &RecordIdentity, ttl: Duration) -> Result<()>;
    }
}

pub fn store_down() -> IdempotencyError {
    IdempotencyError::store_unavailable("redis", anyhow::anyhow!("connection refused"))
}

pub fn settings() -> IdempotencySettings {
    IdempotencySettings::default()
}

pub fn settings_with(configure: impl FnOnce(&mut IdempotencySettings)) -> IdempotencySettings {
    let mut settings = IdempotencySettings::default();
    configure(&mut settings);
    settings
}

pub fn identity(id: &str) -> RecordIdentity {
    RecordIdentity::new([id]).expect("non-empty identity")
}

/// Counts how often each payload was processed.
#[derive(Default)]
pub struct CountingHandler {
    calls: AtomicUsize,
    processed: Mutex<HashMap<String, usize>>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn processed(&self, payload: &str) -> usize {
        self.processed
            .lock()
            .unwrap()
            .get(payload)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, message: &ConsumedMessage) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let payload = String::from_utf8_lossy(&message.value).into_owned();
        *self.processed.lock().unwrap().entry(payload).or_insert(0) += 1;
        Ok(())
    }
}

/// Always fails after counting the call.
#[derive(Default)]
pub struct FailingHandler {
    calls: AtomicUsize,
}

impl FailingHandler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(&self, _message: &ConsumedMessage) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(IdempotencyError::Handler(anyhow::anyhow!("business failure")))
    }
}

pub fn message_with_record_id(record_id: &str, payload: &str) -> ConsumedMessage {
    ConsumedMessage::new("topicA", 0, 0, payload).with_header("record-id", record_id)
}

pub mod consumer;
pub mod listener;

pub use consumer::{ConsumedMessage, ConsumerConfig, DeliveryDecision, EventConsumer, MessageHandler, OffsetReset};
pub use listener::{idempotent, IdempotentListener};

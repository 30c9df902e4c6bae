//! Idempotent message listeners.
//!
//! Wraps a consumer's message handler so that, for records sharing a derived
//! identity, the handler runs at most once within a configurable TTL window.
//! Markers live in a TTL-expiring store (Redis); the check and the marker write
//! are separate operations, so concurrent deliveries of the same record can
//! both be admitted.

pub mod config;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod observability;

pub use error::{IdempotencyError, Result};

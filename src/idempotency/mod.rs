pub mod guard;
pub mod identity;
pub mod storage;

pub use guard::{select_ttl, Admission, GuardStats, IdempotencyGuard, ListenerOptions, StatsSnapshot};
pub use identity::{
    extract_identity, IdentityExtractor, IdentityParameter, IdentityValue, RecordIdentity, ValueKind,
};
pub use storage::{IdempotencyStore, InMemoryIdempotencyStore, KeyNamespace, RedisIdempotencyStore, KEY_DELIMITER};

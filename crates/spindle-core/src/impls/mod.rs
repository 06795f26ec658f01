//! Store implementations.
//!
//! - **InMemoryStore**: single-process store for tests and local runs
//! - **RedisStore**: production store (feature `redis`)

pub mod memory_store;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use self::memory_store::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis_store::RedisStore;

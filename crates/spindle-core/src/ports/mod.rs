//! Ports: the seams to the outside world.
//!
//! - **Store**: the shared persistent store (Redis in production)
//! - **Clock**: current time, swappable in tests
//! - **IdGenerator**: task id minting

pub mod clock;
pub mod id_generator;
pub mod store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::store::{Command, Guard, Store, StoreError, Transaction};

//! Application layer: wiring the broker into running components.
//!
//! - **AppBuilder**: handler registration with a start-up check
//! - **Processor**: the worker pool
//! - **Scheduler**: forwards due scheduled/retry tasks
//! - **Background**: both of the above behind one handle

pub mod background;
pub mod builder;
pub mod processor;
pub mod scheduler;

pub use self::background::{Background, BackgroundHandle};
pub use self::builder::{AppBuilder, BuildError};
pub use self::processor::{Processor, WorkerGroup};
pub use self::scheduler::{Scheduler, SchedulerHandle};

//! Preload scheduling
//!
//! - `queue.rs` - tiered, deduplicating job queue
//! - `pool.rs` - fixed-size decode worker pool
//! - `window.rs` - viewport lookahead selection

pub mod pool;
pub mod queue;
pub mod window;

use crate::decode::DecodedImage;
use crate::error::DecodeError;
use std::sync::Arc;

pub use pool::WorkerPool;
pub use queue::{Job, JobQueue, QueueStats, Submitted};
pub use window::{lookahead, ViewDensity};

/// Result delivered to a requester
pub type Completion = Result<Arc<DecodedImage>, DecodeError>;

/// Receives the result of a queued job exactly once
pub type Waiter = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Dispatch tier. Higher tiers are always drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Whole-library background catch-up
    Library,
    /// Near-term scroll targets
    Viewport,
    /// The item the user just selected
    Interactive,
}

impl Priority {
    pub const COUNT: usize = 3;

    /// Drain order
    pub const DESCENDING: [Priority; Priority::COUNT] =
        [Priority::Interactive, Priority::Viewport, Priority::Library];

    pub fn index(self) -> usize {
        match self {
            Priority::Library => 0,
            Priority::Viewport => 1,
            Priority::Interactive => 2,
        }
    }
}

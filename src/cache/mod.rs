//! Cost-bounded image caches
//!
//! - `lru.rs` - generic count/cost-bounded LRU store
//! - `key.rs` - cache keys and size classes
//! - `store.rs` - thread-safe tier with disk mirror and staleness checks
//! - `disk.rs` - per-key PNG mirror for cross-launch persistence
//! - `staleness.rs` - source modification time checks

pub mod disk;
pub mod key;
pub mod lru;
pub mod staleness;
pub mod store;

pub use disk::DiskMirror;
pub use key::{CacheKey, SizeClass, Tier};
pub use lru::BoundedCache;
pub use store::{CacheEntry, CacheStats, ImageCache};

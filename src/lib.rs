//! Two-tier image cache and preload pipeline for photo browsers
//!
//! This crate handles:
//! - Bounded in-memory caches for thumbnails and previews (cache/)
//! - Disk mirrors that survive restarts (cache/disk.rs)
//! - Memory-bounded decoding, scaled JPEG decoding and SVG rendering (decode/)
//! - Prioritized, deduplicated background preloading (preload/)
//! - The `ImagePipeline` handle tying them together (pipeline/)

pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod library;
pub mod logging;
pub mod pipeline;
pub mod preload;

pub use cache::{CacheKey, CacheStats, SizeClass};
pub use config::{PipelineConfig, TierConfig};
pub use decode::{DecodeEngine, DecodedImage, Decoder, SourceKind, SvgRenderer, VectorRenderer};
pub use error::{ConfigError, DecodeError, LibraryError};
pub use library::{scan_folder, SourceFile};
pub use pipeline::{mailbox, CompletionContext, ImagePipeline, PipelineStats};
pub use preload::{Completion, Priority, ViewDensity};

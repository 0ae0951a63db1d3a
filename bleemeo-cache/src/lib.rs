//! In-memory indexed object cache with versioned on-disk persistence.

pub mod cache;
pub mod persistence;
pub mod snapshot;

pub use cache::ObjectCache;
pub use persistence::{JsonFileStateStore, StateStore, CACHE_VERSION};
pub use snapshot::CacheSnapshot;

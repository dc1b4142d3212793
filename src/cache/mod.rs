//! In-memory resource cache with request deduplication and invalidation.
//!
//! This module is agnostic of the bookstore API. It provides:
//! - A keyed store of entries, one per [`ResourceKey`]
//! - Sharing of a single in-flight fetch between concurrent requesters
//! - Stale-while-revalidate reads with per-key stale times
//! - Retry with exponential backoff for transient failures
//! - Invalidation, removal and direct writes after mutations
//! - Change notification through [`Subscription`]s, with idle eviction

mod effects;
mod entry;
mod key;
mod layer;
mod retry;
mod subscription;

pub use effects::CacheEffects;
pub use entry::{CacheEntry, FetchStatus};
pub use key::{KeyPolicy, ResourceKey};
pub use layer::{CacheOptions, ResourceCache};
pub use retry::RetryPolicy;
pub use subscription::Subscription;

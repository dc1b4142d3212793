//! Bookstore REST API on top of the resource cache.

pub mod cached_client;
pub mod client;
pub mod envelope;
pub mod keys;
pub mod mutations;
pub mod request;
pub mod types;

pub use cached_client::{BookstoreClient, ReadMode};
pub use client::{Executor, HttpExecutor};
pub use mutations::MutationRequest;
pub use request::{ApiRequest, Method};
pub use types::Resource;

//! Cached REST client for a bookstore administration backend.
//!
//! The heart of the crate is [`cache::ResourceCache`], a keyed in-memory
//! cache that deduplicates concurrent fetches, retries transient failures,
//! serves stale data while revalidating and invalidates keys after
//! mutations. [`api::BookstoreClient`] layers the bookstore's resources
//! (books, categories, orders, transactions) on top of it.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod session;

pub use error::FetchError;

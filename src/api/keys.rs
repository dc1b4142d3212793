//! Canonical cache keys for bookstore resources.

use std::time::Duration;

use crate::cache::{KeyPolicy, ResourceKey, RetryPolicy};

pub fn books() -> ResourceKey {
  ResourceKey::collection("books")
}

pub fn book(id: &str) -> ResourceKey {
  ResourceKey::item("book", id)
}

pub fn categories() -> ResourceKey {
  ResourceKey::collection("categories")
}

pub fn category(id: &str) -> ResourceKey {
  ResourceKey::item("category", id)
}

pub fn orders() -> ResourceKey {
  ResourceKey::collection("orders")
}

pub fn order(id: &str) -> ResourceKey {
  ResourceKey::item("order", id)
}

/// Prefix of every per-user order list.
pub fn user_orders_prefix() -> ResourceKey {
  ResourceKey::from(["orders", "user"])
}

pub fn user_orders(user_id: &str) -> ResourceKey {
  user_orders_prefix().child(user_id)
}

pub fn transactions() -> ResourceKey {
  ResourceKey::collection("transactions")
}

/// The signed-in user's own transactions.
pub fn user_transactions() -> ResourceKey {
  ResourceKey::from(["transactions", "user"])
}

pub fn transaction(id: &str) -> ResourceKey {
  ResourceKey::item("transaction", id)
}

pub fn transaction_by_order(order_id: &str) -> ResourceKey {
  ResourceKey::from(["transaction", "order", order_id])
}

pub fn current_user() -> ResourceKey {
  ResourceKey::collection("current-user")
}

/// Built-in stale times. Everything not listed is stale as soon as it lands.
pub fn default_stale_times() -> KeyPolicy<Duration> {
  KeyPolicy::new(Duration::ZERO)
    .with_override(transactions(), Duration::from_secs(5 * 60))
    .with_override(user_transactions(), Duration::from_secs(2 * 60))
    .with_override(current_user(), Duration::from_secs(5 * 60))
}

/// Built-in retry policies derived from `base`.
pub fn default_retry_policies(base: RetryPolicy) -> KeyPolicy<RetryPolicy> {
  KeyPolicy::new(base)
    .with_override(current_user(), RetryPolicy::none())
    .with_override(
      ResourceKey::from(["transaction", "order"]),
      base.with_max_attempts(2),
    )
}

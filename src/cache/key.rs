//! Resource keys and per-key policy lookup.

use std::fmt;

/// Identifies a cached entity set, e.g. `("books")` for a list or
/// `("book", "b1")` for a single item.
///
/// Keys compare structurally; `("transactions", "user")` is a different key
/// from `("transactions")` but starts with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(Vec<String>);

impl ResourceKey {
  pub fn new<I, S>(parts: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(parts.into_iter().map(Into::into).collect())
  }

  /// Key for a whole collection.
  pub fn collection(name: impl Into<String>) -> Self {
    Self(vec![name.into()])
  }

  /// Key for a single item of a collection.
  pub fn item(kind: impl Into<String>, id: impl Into<String>) -> Self {
    Self(vec![kind.into(), id.into()])
  }

  /// Parse the `/`-separated form produced by `Display`.
  pub fn parse(path: &str) -> Self {
    Self::new(path.split('/').filter(|part| !part.is_empty()))
  }

  /// Append a part, producing a more specific key.
  pub fn child(&self, part: impl Into<String>) -> Self {
    let mut parts = self.0.clone();
    parts.push(part.into());
    Self(parts)
  }

  pub fn parts(&self) -> &[String] {
    &self.0
  }

  /// True if `prefix` matches the leading parts of this key.
  /// Every key starts with itself.
  pub fn starts_with(&self, prefix: &ResourceKey) -> bool {
    self.0.starts_with(&prefix.0)
  }
}

impl fmt::Display for ResourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0.join("/"))
  }
}

impl From<&str> for ResourceKey {
  fn from(name: &str) -> Self {
    Self::collection(name)
  }
}

impl<const N: usize> From<[&str; N]> for ResourceKey {
  fn from(parts: [&str; N]) -> Self {
    Self::new(parts)
  }
}

/// A value chosen per key by longest matching prefix, with a fallback.
///
/// Used for stale times and retry policies, where `transactions` and
/// `transactions/user` may need different settings from everything else.
#[derive(Debug, Clone)]
pub struct KeyPolicy<T> {
  default: T,
  overrides: Vec<(ResourceKey, T)>,
}

impl<T: Clone> KeyPolicy<T> {
  pub fn new(default: T) -> Self {
    Self {
      default,
      overrides: Vec::new(),
    }
  }

  /// Use `value` for every key starting with `prefix`.
  pub fn with_override(mut self, prefix: impl Into<ResourceKey>, value: T) -> Self {
    self.set(prefix, value);
    self
  }

  pub fn set(&mut self, prefix: impl Into<ResourceKey>, value: T) {
    let prefix = prefix.into();
    match self.overrides.iter_mut().find(|(k, _)| *k == prefix) {
      Some((_, existing)) => *existing = value,
      None => self.overrides.push((prefix, value)),
    }
  }

  pub fn lookup(&self, key: &ResourceKey) -> &T {
    self
      .overrides
      .iter()
      .filter(|(prefix, _)| key.starts_with(prefix))
      .max_by_key(|(prefix, _)| prefix.parts().len())
      .map(|(_, value)| value)
      .unwrap_or(&self.default)
  }
}

impl<T: Clone + Default> Default for KeyPolicy<T> {
  fn default() -> Self {
    Self::new(T::default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_matches_display() {
    let key = ResourceKey::parse("transactions/user");
    assert_eq!(key, ResourceKey::from(["transactions", "user"]));
    assert_eq!(key.to_string(), "transactions/user");
    assert_eq!(ResourceKey::parse("/books/"), ResourceKey::collection("books"));
  }

  #[test]
  fn test_structural_equality() {
    assert_eq!(ResourceKey::item("book", "b1"), ResourceKey::from(["book", "b1"]));
    assert_ne!(ResourceKey::item("book", "b1"), ResourceKey::item("book", "b2"));
    assert_ne!(ResourceKey::collection("books"), ResourceKey::item("books", ""));
  }

  #[test]
  fn test_prefix_matching() {
    let user = ResourceKey::from(["transactions", "user"]);
    assert!(user.starts_with(&ResourceKey::collection("transactions")));
    assert!(user.starts_with(&user));
    assert!(!ResourceKey::collection("transactions").starts_with(&user));
    assert!(!ResourceKey::collection("transaction").starts_with(&"transactions".into()));
  }

  #[test]
  fn test_display_joins_parts() {
    assert_eq!(ResourceKey::item("order", "o-7").to_string(), "order/o-7");
    assert_eq!(ResourceKey::collection("books").child("x").to_string(), "books/x");
  }

  #[test]
  fn test_policy_longest_prefix_wins() {
    let policy = KeyPolicy::new(0u64)
      .with_override("transactions", 300)
      .with_override(["transactions", "user"], 120);

    assert_eq!(*policy.lookup(&"books".into()), 0);
    assert_eq!(*policy.lookup(&"transactions".into()), 300);
    assert_eq!(*policy.lookup(&["transactions", "user"].into()), 120);
    assert_eq!(*policy.lookup(&["transactions", "other"].into()), 300);
  }

  #[test]
  fn test_policy_set_replaces_existing_override() {
    let mut policy = KeyPolicy::new(1u64).with_override("books", 2);
    policy.set("books", 3);
    assert_eq!(*policy.lookup(&"books".into()), 3);
  }
}

//! Response normalization.
//!
//! The backend is inconsistent about wrapping: the same resource may come
//! back as `{"data": {"books": [...]}}`, `{"data": [...]}`, `{"books": [...]}`
//! or a bare array. Decoders try each shape in that order and take the first
//! one that deserializes.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::FetchError;

fn candidates<'a>(body: &'a Value, field: &str) -> impl Iterator<Item = &'a Value> {
  let data = body.get("data");
  [
    data.and_then(|d| d.get(field)),
    data,
    body.get(field),
    Some(body),
  ]
  .into_iter()
  .flatten()
}

fn decode<T: DeserializeOwned>(body: &Value, field: &str) -> Result<T, FetchError> {
  candidates(body, field)
    .find_map(|value| T::deserialize(value).ok())
    .ok_or_else(|| {
      warn!(field, "unexpected response structure");
      FetchError::Decode(format!("unexpected response structure for `{field}`"))
    })
}

/// Decode a collection found under `field` (e.g. `books`).
pub fn decode_list<T: DeserializeOwned>(body: &Value, field: &str) -> Result<Vec<T>, FetchError> {
  decode(body, field)
}

/// Decode a single entity found under `field` (e.g. `book`).
pub fn decode_item<T: DeserializeOwned>(body: &Value, field: &str) -> Result<T, FetchError> {
  decode(body, field)
}

#[derive(Deserialize)]
struct Ack {
  success: bool,
  #[serde(default)]
  message: Option<String>,
  #[serde(default)]
  error: Option<String>,
}

/// Accept the body of a delete or other acknowledgement-only call.
///
/// Any 2xx body is accepted unless it is `{"success": false, ...}`.
pub fn decode_ack(body: &Value) -> Result<(), FetchError> {
  match Ack::deserialize(body) {
    Ok(Ack {
      success: false,
      message,
      error,
    }) => Err(FetchError::Decode(format!(
      "server reported failure: {}",
      error.or(message).unwrap_or_else(|| "no reason given".into())
    ))),
    _ => Ok(()),
  }
}

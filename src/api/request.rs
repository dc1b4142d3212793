//! Transport-neutral description of one REST call.

use serde::Serialize;
use serde_json::Value;

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Delete => "DELETE",
    }
  }
}

/// A request relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  /// Path below the base URL, starting with `/`
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
}

impl ApiRequest {
  fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: None,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::Get, path)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::Delete, path)
  }

  /// A POST with a JSON body.
  pub fn post<B: Serialize>(path: impl Into<String>, body: &B) -> Result<Self, FetchError> {
    Self::new(Method::Post, path).with_body(body)
  }

  /// A PUT with a JSON body.
  pub fn put<B: Serialize>(path: impl Into<String>, body: &B) -> Result<Self, FetchError> {
    Self::new(Method::Put, path).with_body(body)
  }

  pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.query.push((name.into(), value.into()));
    self
  }

  fn with_body<B: Serialize>(mut self, body: &B) -> Result<Self, FetchError> {
    let value =
      serde_json::to_value(body).map_err(|e| FetchError::Decode(format!("encode body: {e}")))?;
    self.body = Some(value);
    Ok(self)
  }
}

impl std::fmt::Display for ApiRequest {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method.as_str(), self.path)
  }
}

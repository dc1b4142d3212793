//! Executes [`ApiRequest`]s against the bookstore REST API.

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::request::{ApiRequest, Method};
use crate::config::ApiConfig;
use crate::error::FetchError;
use crate::session::Session;

/// Something that can perform a request and hand back the decoded JSON body.
///
/// The cache never talks to the network directly; loaders and mutations go
/// through an executor so tests can substitute a scripted one.
pub trait Executor: Clone + Send + Sync + 'static {
  fn execute(&self, request: ApiRequest) -> impl Future<Output = Result<Value, FetchError>> + Send;
}

/// reqwest-backed executor with bearer auth from the [`Session`].
#[derive(Clone)]
pub struct HttpExecutor {
  client: reqwest::Client,
  base_url: String,
  timeout: Duration,
  session: Session,
}

impl HttpExecutor {
  pub fn new(config: &ApiConfig, session: Session) -> color_eyre::Result<Self> {
    let timeout = config.timeout();
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: config.base_url.trim_end_matches('/').to_string(),
      timeout,
      session,
    })
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  fn transport_error(&self, request: &ApiRequest, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
      warn!(%request, timeout = ?self.timeout, "request timed out");
      FetchError::Timeout(self.timeout)
    } else if err.is_decode() {
      FetchError::Decode(err.to_string())
    } else {
      warn!(%request, error = %err, "network error, is the server running?");
      FetchError::Network(err.to_string())
    }
  }
}

impl Executor for HttpExecutor {
  async fn execute(&self, request: ApiRequest) -> Result<Value, FetchError> {
    let url = format!("{}{}", self.base_url, request.path);
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self
      .client
      .request(method, &url)
      .header(ACCEPT, "application/json")
      .header(CONTENT_TYPE, "application/json");
    if !request.query.is_empty() {
      builder = builder.query(&request.query);
    }
    if let Some(token) = self.session.token() {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    debug!(%request, "sending request");
    let response = builder
      .send()
      .await
      .map_err(|e| self.transport_error(&request, e))?;
    let status = response.status().as_u16();
    let text = response
      .text()
      .await
      .map_err(|e| self.transport_error(&request, e))?;

    if let Some(err) = classify_status(status, &text) {
      match status {
        401 => warn!(%request, "authentication failed"),
        403 => warn!(%request, "access forbidden, insufficient permissions"),
        404 => warn!(%request, "resource not found"),
        _ => warn!(%request, status, "request failed"),
      }
      return Err(err);
    }
    parse_body(&text)
  }
}

/// Map a response status to an error, if it is one.
pub fn classify_status(status: u16, body: &str) -> Option<FetchError> {
  (status >= 400).then(|| FetchError::Http {
    status,
    body: body.to_string(),
  })
}

/// Parse a successful response body. An empty body (e.g. 204) is `null`.
pub fn parse_body(text: &str) -> Result<Value, FetchError> {
  if text.trim().is_empty() {
    return Ok(Value::Null);
  }
  serde_json::from_str(text).map_err(|e| FetchError::Decode(format!("invalid JSON body: {e}")))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;
  use tokio::task::JoinHandle;

  fn executor_for(base_url: String, token: Option<&str>) -> HttpExecutor {
    let session = Session::in_memory().unwrap();
    if let Some(token) = token {
      session.use_token(token);
    }
    let config = ApiConfig {
      base_url,
      timeout_secs: 1,
    };
    HttpExecutor::new(&config, session).unwrap()
  }

  /// Answer one request with `response` and hand back the request head.
  async fn serve_once(response: String) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut head = Vec::new();
      let mut buf = [0u8; 1024];
      while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
          break;
        }
        head.extend_from_slice(&buf[..n]);
      }
      socket.write_all(response.as_bytes()).await.unwrap();
      socket.shutdown().await.unwrap();
      String::from_utf8_lossy(&head).into_owned()
    });
    (format!("http://{addr}/api"), server)
  }

  fn http_response(status: &str, body: &str) -> String {
    format!(
      "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
      body.len()
    )
  }

  #[tokio::test]
  async fn test_bearer_token_and_query_are_sent() {
    let (base_url, server) = serve_once(http_response("200 OK", r#"{"data":{"books":[]}}"#)).await;
    let executor = executor_for(base_url, Some("tok-123"));

    let body = executor
      .execute(ApiRequest::get("/books").with_query("page", "2"))
      .await
      .unwrap();
    assert_eq!(body["data"]["books"], serde_json::json!([]));

    let head = server.await.unwrap().to_lowercase();
    assert!(head.starts_with("get /api/books?page=2 http/1.1"), "{head}");
    assert!(head.contains("authorization: bearer tok-123"), "{head}");
    assert!(head.contains("accept: application/json"), "{head}");
  }

  #[tokio::test]
  async fn test_anonymous_request_has_no_authorization() {
    let (base_url, server) = serve_once(http_response("204 No Content", "")).await;
    let executor = executor_for(base_url, None);

    let body = executor.execute(ApiRequest::delete("/books/b1")).await.unwrap();
    assert_eq!(body, Value::Null);

    let head = server.await.unwrap().to_lowercase();
    assert!(head.starts_with("delete /api/books/b1 "), "{head}");
    assert!(!head.contains("authorization:"), "{head}");
  }

  #[tokio::test]
  async fn test_error_status_becomes_http_error() {
    let (base_url, server) = serve_once(http_response("404 Not Found", r#"{"message":"no such book"}"#)).await;
    let executor = executor_for(base_url, Some("tok-123"));

    let err = executor.execute(ApiRequest::get("/books/nope")).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!err.is_transient());
    server.await.unwrap();
  }

  #[tokio::test]
  async fn test_silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Accept and hold the connection without ever answering
    let _server = tokio::spawn(async move {
      let (_socket, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(30)).await;
    });
    let executor = executor_for(format!("http://{addr}/api"), None);

    let err = executor.execute(ApiRequest::get("/books")).await.unwrap_err();
    assert_eq!(err, FetchError::Timeout(Duration::from_secs(1)));
    assert!(err.is_transient());
  }

  #[tokio::test]
  async fn test_refused_connection_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let executor = executor_for(format!("http://{addr}/api"), None);

    let err = executor.execute(ApiRequest::get("/books")).await.unwrap_err();
    assert!(matches!(err, FetchError::Network(_)), "{err:?}");
    assert!(err.is_transient());
  }

  #[test]
  fn test_classify_status() {
    assert!(classify_status(200, "").is_none());
    assert!(classify_status(204, "").is_none());
    assert_eq!(
      classify_status(404, "missing"),
      Some(FetchError::Http {
        status: 404,
        body: "missing".into()
      })
    );
    assert!(classify_status(503, "").unwrap().is_transient());
  }

  #[test]
  fn test_parse_body() {
    assert_eq!(parse_body("").unwrap(), Value::Null);
    assert_eq!(parse_body("  \n").unwrap(), Value::Null);
    assert_eq!(parse_body(r#"{"success":true}"#).unwrap()["success"], true);
    assert!(matches!(parse_body("<html>"), Err(FetchError::Decode(_))));
  }

  #[test]
  fn test_trailing_slash_is_trimmed_from_base_url() {
    let config = ApiConfig {
      base_url: "http://localhost:8080/api/".into(),
      ..ApiConfig::default()
    };
    let executor = HttpExecutor::new(&config, Session::in_memory().unwrap()).unwrap();
    assert_eq!(executor.base_url(), "http://localhost:8080/api");
  }
}

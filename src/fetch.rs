//! Fetch executor: the single outbound request primitive used by the cache.

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

/// Response body as seen by the cache. Opaque to the engine.
pub type Data = Value;

/// Transport failure for a single request.
///
/// Cloned into every cache entry and waiter that observes the failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("invalid request url `{url}`: {reason}")]
  InvalidUrl { url: String, reason: String },
  #[error("transport error: {0}")]
  Transport(String),
  #[error("request failed with status {status}: {body}")]
  Status { status: u16, body: String },
  #[error("failed to decode response: {0}")]
  Decode(String),
  #[error("request was cancelled")]
  Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

/// Transport-level description of one request, produced by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
  /// Path relative to the executor's base url (or an absolute url)
  pub url: String,
  pub method: Method,
  /// Query string parameters
  #[serde(default)]
  pub params: BTreeMap<String, String>,
  /// JSON body, sent for non-GET requests
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
}

impl RequestDescriptor {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method,
      params: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn post(url: impl Into<String>) -> Self {
    Self::new(Method::Post, url)
  }

  pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    self.params.insert(name.into(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }
}

/// A pluggable transport.
///
/// Implementations perform exactly one network call per `execute` and never
/// retry internally.
#[async_trait]
pub trait FetchExecutor: Send + Sync {
  async fn execute(&self, request: RequestDescriptor) -> Result<Data, FetchError>;
}

/// Executor backed by a closure, for custom transports and tests.
pub struct FnExecutor<F> {
  f: F,
}

impl<F, Fut> FnExecutor<F>
where
  F: Fn(RequestDescriptor) -> Fut + Send + Sync,
  Fut: Future<Output = Result<Data, FetchError>> + Send + 'static,
{
  pub fn new(f: F) -> Self {
    Self { f }
  }
}

#[async_trait]
impl<F, Fut> FetchExecutor for FnExecutor<F>
where
  F: Fn(RequestDescriptor) -> Fut + Send + Sync,
  Fut: Future<Output = Result<Data, FetchError>> + Send + 'static,
{
  async fn execute(&self, request: RequestDescriptor) -> Result<Data, FetchError> {
    (self.f)(request).await
  }
}

/// HTTP executor over `reqwest`.
///
/// Credentials are supplied as default query parameters appended to every
/// request; how they are sourced is up to the caller.
#[derive(Clone)]
pub struct HttpExecutor {
  client: reqwest::Client,
  base_url: Url,
  default_params: BTreeMap<String, String>,
}

impl HttpExecutor {
  pub fn new(base_url: &str) -> Result<Self, FetchError> {
    let base_url = Url::parse(base_url).map_err(|e| FetchError::InvalidUrl {
      url: base_url.to_string(),
      reason: e.to_string(),
    })?;

    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| FetchError::Transport(e.to_string()))?;

    Ok(Self {
      client,
      base_url,
      default_params: BTreeMap::new(),
    })
  }

  /// Add a parameter sent with every request, e.g. an API key.
  pub fn with_default_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.default_params.insert(name.into(), value.into());
    self
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Resolve a descriptor into the final url, including query parameters.
  fn resolve(&self, request: &RequestDescriptor) -> Result<Url, FetchError> {
    let mut url = self
      .base_url
      .join(&request.url)
      .map_err(|e| FetchError::InvalidUrl {
        url: request.url.clone(),
        reason: e.to_string(),
      })?;

    let defaults = self
      .default_params
      .iter()
      .filter(|(name, _)| !request.params.contains_key(*name));
    let params: Vec<(&String, &String)> = defaults.chain(request.params.iter()).collect();

    if !params.is_empty() {
      let mut pairs = url.query_pairs_mut();
      for (name, value) in params {
        pairs.append_pair(name, value);
      }
    }

    Ok(url)
  }
}

#[async_trait]
impl FetchExecutor for HttpExecutor {
  async fn execute(&self, request: RequestDescriptor) -> Result<Data, FetchError> {
    let url = self.resolve(&request)?;
    debug!(method = ?request.method, path = %url.path(), "executing request");

    let mut builder = self.client.request(request.method.into(), url);
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(FetchError::Status {
        status: status.as_u16(),
        body,
      });
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| FetchError::Transport(e.to_string()))?;
    trace!(len = bytes.len(), "response received");

    if bytes.is_empty() {
      return Ok(Value::Null);
    }

    serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
  }
}

//! Cached OMDb client built on the query cache.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};

use crate::cache::{CacheConfig, QueryClient, QueryOptions, StoreMiddleware};
use crate::config::Config;
use crate::endpoint::{EndpointRegistry, QueryEndpoint};
use crate::fetch::HttpExecutor;
use crate::query::UseQuery;

use super::api::{get_configuration, search_movies};
use super::types::{Configuration, SearchPage, SearchResponse};

/// OMDb client with transparent caching.
///
/// Repeated reads with the same arguments are served from the cache while
/// fresh, and concurrent reads share one request.
#[derive(Clone)]
pub struct CachedOmdbClient {
  client: QueryClient,
  search_movies: QueryEndpoint<String, SearchResponse>,
  get_configuration: QueryEndpoint<(), Configuration>,
}

impl CachedOmdbClient {
  /// Create a client with the API key taken from the environment.
  pub fn new(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    Self::with_api_key(config, &api_key)
  }

  pub fn with_api_key(config: &Config, api_key: &str) -> Result<Self> {
    let executor = HttpExecutor::new(&config.api.base_url)?
      .with_default_param(config.api.api_key_param.clone(), api_key);

    let search_movies = search_movies();
    let get_configuration = get_configuration();

    let registry = Arc::new(EndpointRegistry::new());
    registry.register(search_movies.definition())?;

    let client = QueryClient::new(
      registry,
      Arc::new(executor),
      CacheConfig::from(config.cache),
    );
    // Extension endpoints are added to the running client
    client.inject_endpoints([get_configuration.definition()])?;

    Ok(Self {
      client,
      search_movies,
      get_configuration,
    })
  }

  pub fn query_client(&self) -> &QueryClient {
    &self.client
  }

  pub fn add_middleware(&self, middleware: Arc<dyn StoreMiddleware>) {
    self.client.add_middleware(middleware);
  }

  /// Search titles matching `term`.
  pub async fn search_movies(&self, term: &str) -> Result<SearchPage> {
    let mut query = self.watch_search(term, QueryOptions::default())?;
    let response = query.settled().await?.clone();
    response.into_page().map_err(|e| eyre!("OMDb search failed: {}", e))
  }

  /// Subscribe to the search for `term`, e.g. to keep it polled.
  pub fn watch_search(&self, term: &str, options: QueryOptions) -> Result<UseQuery<SearchResponse>> {
    Ok(
      self
        .client
        .use_query(&self.search_movies, &term.to_string(), options)?,
    )
  }

  /// Get the image configuration.
  pub async fn configuration(&self) -> Result<Configuration> {
    let mut query = self
      .client
      .use_query(&self.get_configuration, &(), QueryOptions::default())?;
    Ok(query.settled().await?.clone())
  }
}

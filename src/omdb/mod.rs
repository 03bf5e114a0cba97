//! OMDb movie API declared on top of the query cache.

mod api;
mod cached_client;
mod types;

pub use api::{get_configuration, search_movies, GET_CONFIGURATION, SEARCH_MOVIES};
pub use cached_client::CachedOmdbClient;
pub use types::{Configuration, ImageConfiguration, MovieSummary, SearchPage, SearchResponse};

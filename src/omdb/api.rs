//! Endpoint declarations.

use crate::endpoint::QueryEndpoint;
use crate::fetch::RequestDescriptor;

use super::types::{Configuration, SearchResponse};

pub const SEARCH_MOVIES: &str = "searchMovies";
pub const GET_CONFIGURATION: &str = "getConfiguration";

/// Title search, `GET /?s=<term>`.
pub fn search_movies() -> QueryEndpoint<String, SearchResponse> {
  QueryEndpoint::new(SEARCH_MOVIES, |term: &String| {
    RequestDescriptor::get("").with_param("s", term)
  })
}

/// Image configuration, `GET /configuration`. Injected after the base API.
pub fn get_configuration() -> QueryEndpoint<(), Configuration> {
  QueryEndpoint::new(GET_CONFIGURATION, |_: &()| {
    RequestDescriptor::get("configuration")
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::endpoint::{EndpointKind, EndpointRegistry};

  #[test]
  fn test_search_request_carries_term() {
    let request = search_movies()
      .definition()
      .build_request("alien")
      .unwrap();

    assert_eq!(request.url, "");
    assert_eq!(request.params.get("s").map(String::as_str), Some("alien"));
  }

  #[test]
  fn test_configuration_is_injected_incrementally() {
    let registry = EndpointRegistry::new();
    registry.register(search_movies().definition()).unwrap();
    registry
      .inject([search_movies().definition(), get_configuration().definition()])
      .unwrap();

    assert_eq!(registry.len(), 2);
    assert!(registry.require(GET_CONFIGURATION, EndpointKind::Query).is_ok());
  }
}

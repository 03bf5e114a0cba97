//! Serde types matching OMDb responses, plus the domain types derived from them.

use serde::{Deserialize, Serialize};

/// Raw `?s=` search response.
///
/// OMDb reports failures in-band: `Response` is `"False"` and `Error` holds
/// the reason, with a 200 status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
  #[serde(rename = "Search", default)]
  pub search: Vec<MovieSummary>,
  #[serde(rename = "totalResults", default)]
  pub total_results: Option<String>,
  #[serde(rename = "Response")]
  pub response: String,
  #[serde(rename = "Error", default)]
  pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieSummary {
  #[serde(rename = "Title")]
  pub title: String,
  #[serde(rename = "Year")]
  pub year: String,
  #[serde(rename = "imdbID")]
  pub imdb_id: String,
  #[serde(rename = "Type")]
  pub kind: String,
  /// "N/A" when OMDb has no poster
  #[serde(rename = "Poster", default)]
  pub poster: Option<String>,
}

/// One page of search results
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
  pub movies: Vec<MovieSummary>,
  pub total: u32,
}

impl SearchResponse {
  /// Convert to a result page, surfacing in-band errors.
  ///
  /// "Movie not found!" is an empty page rather than an error.
  pub fn into_page(self) -> Result<SearchPage, String> {
    if self.response.eq_ignore_ascii_case("true") {
      let total = self
        .total_results
        .as_deref()
        .and_then(|t| t.parse().ok())
        .unwrap_or(self.search.len() as u32);
      return Ok(SearchPage {
        movies: self.search,
        total,
      });
    }

    match self.error {
      Some(error) if error.eq_ignore_ascii_case("movie not found!") => Ok(SearchPage {
        movies: Vec::new(),
        total: 0,
      }),
      Some(error) => Err(error),
      None => Err("search failed without a reason".to_string()),
    }
  }
}

/// Image and change-key configuration served by `/configuration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
  pub images: ImageConfiguration,
  #[serde(default)]
  pub change_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfiguration {
  pub base_url: String,
  pub secure_base_url: String,
  #[serde(default)]
  pub backdrop_sizes: Vec<String>,
  #[serde(default)]
  pub logo_sizes: Vec<String>,
  #[serde(default)]
  pub poster_sizes: Vec<String>,
  #[serde(default)]
  pub profile_sizes: Vec<String>,
  #[serde(default)]
  pub still_sizes: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_search_response_success() {
    let response: SearchResponse = serde_json::from_value(json!({
      "Search": [
        {"Title": "Alien", "Year": "1979", "imdbID": "tt0078748", "Type": "movie", "Poster": "N/A"}
      ],
      "totalResults": "42",
      "Response": "True"
    }))
    .unwrap();

    let page = response.into_page().unwrap();
    assert_eq!(page.total, 42);
    assert_eq!(page.movies[0].imdb_id, "tt0078748");
    assert_eq!(page.movies[0].kind, "movie");
  }

  #[test]
  fn test_search_response_not_found_is_empty() {
    let response: SearchResponse =
      serde_json::from_value(json!({"Response": "False", "Error": "Movie not found!"})).unwrap();

    let page = response.into_page().unwrap();
    assert!(page.movies.is_empty());
    assert_eq!(page.total, 0);
  }

  #[test]
  fn test_search_response_error() {
    let response: SearchResponse =
      serde_json::from_value(json!({"Response": "False", "Error": "Invalid API key!"})).unwrap();

    assert_eq!(response.into_page().unwrap_err(), "Invalid API key!");
  }

  #[test]
  fn test_configuration_defaults_missing_sizes() {
    let configuration: Configuration = serde_json::from_value(json!({
      "images": {
        "base_url": "http://image.example/t/p/",
        "secure_base_url": "https://image.example/t/p/",
        "poster_sizes": ["w92", "original"]
      }
    }))
    .unwrap();

    assert_eq!(configuration.images.poster_sizes, vec!["w92", "original"]);
    assert!(configuration.images.logo_sizes.is_empty());
    assert!(configuration.change_keys.is_empty());
  }
}

use thiserror::Error;

use crate::cache::KeyError;
use crate::endpoint::RegistryError;
use crate::fetch::FetchError;

/// Errors returned by query client operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
  #[error(transparent)]
  Key(#[from] KeyError),
  #[error(transparent)]
  Registry(#[from] RegistryError),
  #[error(transparent)]
  Fetch(#[from] FetchError),
  #[error("failed to decode result of `{endpoint}`: {reason}")]
  Decode { endpoint: String, reason: String },
}

//! Endpoint definitions and the registry that owns them.
//!
//! Endpoints are declared through typed handles ([`QueryEndpoint`] and
//! [`MutationEndpoint`]) whose argument and result types are fixed when the
//! handle is built. The registry stores the type-erased definition together
//! with its shape so that incremental injection can detect conflicts.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::fetch::RequestDescriptor;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
  #[error("endpoint `{id}` is already registered with a different shape ({existing} vs {requested})")]
  DuplicateEndpoint {
    id: String,
    existing: String,
    requested: String,
  },
  #[error("unknown endpoint `{0}`")]
  UnknownEndpoint(String),
  #[error("endpoint `{id}` is a {actual}, not a {expected}")]
  WrongKind {
    id: String,
    expected: EndpointKind,
    actual: EndpointKind,
  },
  #[error("invalid arguments for endpoint `{id}`: {reason}")]
  InvalidArguments { id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
  /// Read, cacheable
  Query,
  /// Write, cache-invalidating
  Mutation,
}

impl fmt::Display for EndpointKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EndpointKind::Query => f.write_str("query"),
      EndpointKind::Mutation => f.write_str("mutation"),
    }
  }
}

/// Everything that must match for two registrations of one identifier to be
/// considered the same endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointShape {
  pub kind: EndpointKind,
  pub args: &'static str,
  pub result: &'static str,
  pub invalidates: BTreeSet<String>,
}

impl fmt::Display for EndpointShape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({}) -> {}", self.kind, self.args, self.result)?;
    if !self.invalidates.is_empty() {
      let targets: Vec<&str> = self.invalidates.iter().map(String::as_str).collect();
      write!(f, " invalidates [{}]", targets.join(", "))?;
    }
    Ok(())
  }
}

type BuildFn = dyn Fn(Value) -> Result<RequestDescriptor, serde_json::Error> + Send + Sync;

/// Type-erased endpoint definition. Immutable once built.
pub struct EndpointDefinition {
  id: String,
  shape: EndpointShape,
  build: Box<BuildFn>,
}

impl EndpointDefinition {
  fn new<A, F>(id: String, shape: EndpointShape, build: F) -> Self
  where
    A: DeserializeOwned + 'static,
    F: Fn(&A) -> RequestDescriptor + Send + Sync + 'static,
  {
    Self {
      id,
      shape,
      build: Box::new(move |value| {
        let args: A = serde_json::from_value(value)?;
        Ok(build(&args))
      }),
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn kind(&self) -> EndpointKind {
    self.shape.kind
  }

  pub fn shape(&self) -> &EndpointShape {
    &self.shape
  }

  pub fn invalidates(&self) -> &BTreeSet<String> {
    &self.shape.invalidates
  }

  /// Map an argument value to the transport request.
  pub fn build_request<A>(&self, args: &A) -> Result<RequestDescriptor, RegistryError>
  where
    A: Serialize + ?Sized,
  {
    let invalid = |e: serde_json::Error| RegistryError::InvalidArguments {
      id: self.id.clone(),
      reason: e.to_string(),
    };

    let value = serde_json::to_value(args).map_err(invalid)?;
    (self.build)(value).map_err(invalid)
  }
}

impl fmt::Debug for EndpointDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EndpointDefinition")
      .field("id", &self.id)
      .field("shape", &self.shape)
      .finish_non_exhaustive()
  }
}

/// Typed handle for a read endpoint taking `A` and producing `R`.
pub struct QueryEndpoint<A, R> {
  definition: Arc<EndpointDefinition>,
  _types: PhantomData<fn(A) -> R>,
}

impl<A, R> QueryEndpoint<A, R>
where
  A: Serialize + DeserializeOwned + 'static,
  R: DeserializeOwned + 'static,
{
  pub fn new<F>(id: impl Into<String>, build: F) -> Self
  where
    F: Fn(&A) -> RequestDescriptor + Send + Sync + 'static,
  {
    let shape = EndpointShape {
      kind: EndpointKind::Query,
      args: std::any::type_name::<A>(),
      result: std::any::type_name::<R>(),
      invalidates: BTreeSet::new(),
    };

    Self {
      definition: Arc::new(EndpointDefinition::new(id.into(), shape, build)),
      _types: PhantomData,
    }
  }
}

impl<A, R> QueryEndpoint<A, R> {
  pub fn id(&self) -> &str {
    self.definition.id()
  }

  pub fn definition(&self) -> Arc<EndpointDefinition> {
    Arc::clone(&self.definition)
  }
}

impl<A, R> Clone for QueryEndpoint<A, R> {
  fn clone(&self) -> Self {
    Self {
      definition: Arc::clone(&self.definition),
      _types: PhantomData,
    }
  }
}

/// Typed handle for a write endpoint taking `A` and producing `R`.
pub struct MutationEndpoint<A, R> {
  definition: Arc<EndpointDefinition>,
  _types: PhantomData<fn(A) -> R>,
}

impl<A, R> MutationEndpoint<A, R>
where
  A: Serialize + DeserializeOwned + 'static,
  R: DeserializeOwned + 'static,
{
  /// Build a mutation that invalidates the given query endpoints on success.
  pub fn new<F, I, S>(id: impl Into<String>, invalidates: I, build: F) -> Self
  where
    F: Fn(&A) -> RequestDescriptor + Send + Sync + 'static,
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let shape = EndpointShape {
      kind: EndpointKind::Mutation,
      args: std::any::type_name::<A>(),
      result: std::any::type_name::<R>(),
      invalidates: invalidates.into_iter().map(Into::into).collect(),
    };

    Self {
      definition: Arc::new(EndpointDefinition::new(id.into(), shape, build)),
      _types: PhantomData,
    }
  }
}

impl<A, R> MutationEndpoint<A, R> {
  pub fn id(&self) -> &str {
    self.definition.id()
  }

  pub fn definition(&self) -> Arc<EndpointDefinition> {
    Arc::clone(&self.definition)
  }
}

impl<A, R> Clone for MutationEndpoint<A, R> {
  fn clone(&self) -> Self {
    Self {
      definition: Arc::clone(&self.definition),
      _types: PhantomData,
    }
  }
}

/// Set of declared endpoints, built at startup and shared by reference.
///
/// Read-only after startup except for [`EndpointRegistry::inject`].
#[derive(Debug, Default)]
pub struct EndpointRegistry {
  endpoints: RwLock<HashMap<String, Arc<EndpointDefinition>>>,
}

impl EndpointRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register one endpoint.
  ///
  /// Registering an identifier again with the same shape keeps the existing
  /// definition; a different shape is a [`RegistryError::DuplicateEndpoint`].
  pub fn register(&self, definition: Arc<EndpointDefinition>) -> Result<(), RegistryError> {
    self.inject([definition])
  }

  /// Register a batch of endpoints. Either all are accepted or none are.
  pub fn inject<I>(&self, definitions: I) -> Result<(), RegistryError>
  where
    I: IntoIterator<Item = Arc<EndpointDefinition>>,
  {
    let definitions: Vec<Arc<EndpointDefinition>> = definitions.into_iter().collect();
    let mut endpoints = self
      .endpoints
      .write()
      .unwrap_or_else(PoisonError::into_inner);

    let mut batch: HashMap<&str, &EndpointShape> = HashMap::new();
    for definition in &definitions {
      let existing = endpoints
        .get(definition.id())
        .map(|d| d.shape())
        .or_else(|| batch.get(definition.id()).copied());

      if let Some(existing) = existing {
        if existing != definition.shape() {
          return Err(RegistryError::DuplicateEndpoint {
            id: definition.id().to_string(),
            existing: existing.to_string(),
            requested: definition.shape().to_string(),
          });
        }
      }
      batch.insert(definition.id(), definition.shape());
    }

    for definition in definitions {
      if endpoints.contains_key(definition.id()) {
        debug!(endpoint = definition.id(), "endpoint already registered, keeping existing");
        continue;
      }
      info!(endpoint = definition.id(), kind = %definition.kind(), "registered endpoint");
      endpoints.insert(definition.id().to_string(), definition);
    }

    Ok(())
  }

  pub fn get(&self, id: &str) -> Option<Arc<EndpointDefinition>> {
    self
      .endpoints
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(id)
      .cloned()
  }

  pub fn contains(&self, id: &str) -> bool {
    self.get(id).is_some()
  }

  /// Look up an endpoint, requiring it to be of `kind`.
  pub fn require(&self, id: &str, kind: EndpointKind) -> Result<Arc<EndpointDefinition>, RegistryError> {
    let definition = self
      .get(id)
      .ok_or_else(|| RegistryError::UnknownEndpoint(id.to_string()))?;

    if definition.kind() != kind {
      return Err(RegistryError::WrongKind {
        id: id.to_string(),
        expected: kind,
        actual: definition.kind(),
      });
    }

    Ok(definition)
  }

  /// Query endpoints invalidated by a successful `mutation_id`.
  pub fn resolve_invalidation(&self, mutation_id: &str) -> Result<BTreeSet<String>, RegistryError> {
    let definition = self.require(mutation_id, EndpointKind::Mutation)?;
    Ok(definition.invalidates().clone())
  }

  pub fn len(&self) -> usize {
    self
      .endpoints
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, Serialize, Deserialize)]
  struct UserArgs {
    id: u32,
  }

  #[derive(Debug, Deserialize)]
  struct User {
    #[allow(dead_code)]
    name: String,
  }

  fn get_user() -> QueryEndpoint<UserArgs, User> {
    QueryEndpoint::new("getUser", |args: &UserArgs| {
      RequestDescriptor::get(format!("users/{}", args.id))
    })
  }

  fn update_user() -> MutationEndpoint<UserArgs, User> {
    MutationEndpoint::new("updateUser", ["getUser"], |args: &UserArgs| {
      RequestDescriptor::new(crate::fetch::Method::Put, format!("users/{}", args.id))
    })
  }

  #[test]
  fn test_register_and_build_request() {
    let registry = EndpointRegistry::new();
    registry.register(get_user().definition()).unwrap();

    let definition = registry.require("getUser", EndpointKind::Query).unwrap();
    let request = definition.build_request(&UserArgs { id: 7 }).unwrap();
    assert_eq!(request.url, "users/7");
  }

  #[test]
  fn test_same_shape_is_accepted_and_keeps_original() {
    let registry = EndpointRegistry::new();
    let first = get_user().definition();
    registry.register(Arc::clone(&first)).unwrap();
    registry.register(get_user().definition()).unwrap();

    assert_eq!(registry.len(), 1);
    assert!(Arc::ptr_eq(&registry.get("getUser").unwrap(), &first));
  }

  #[test]
  fn test_conflicting_kind_is_duplicate() {
    let registry = EndpointRegistry::new();
    registry.register(get_user().definition()).unwrap();

    let clash: MutationEndpoint<UserArgs, User> =
      MutationEndpoint::new("getUser", Vec::<String>::new(), |_: &UserArgs| {
        RequestDescriptor::post("users")
      });

    let err = registry.register(clash.definition()).unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateEndpoint { ref id, .. } if id == "getUser"));
  }

  #[test]
  fn test_conflicting_argument_type_is_duplicate() {
    let registry = EndpointRegistry::new();
    registry.register(get_user().definition()).unwrap();

    let clash: QueryEndpoint<String, User> =
      QueryEndpoint::new("getUser", |name: &String| RequestDescriptor::get(format!("users/{}", name)));

    assert!(registry.register(clash.definition()).is_err());
  }

  #[test]
  fn test_inject_is_all_or_nothing() {
    let registry = EndpointRegistry::new();
    registry.register(get_user().definition()).unwrap();

    let clash: QueryEndpoint<String, User> =
      QueryEndpoint::new("getUser", |_: &String| RequestDescriptor::get("users"));

    let result = registry.inject([update_user().definition(), clash.definition()]);
    assert!(result.is_err());
    assert!(!registry.contains("updateUser"));
  }

  #[test]
  fn test_resolve_invalidation() {
    let registry = EndpointRegistry::new();
    registry
      .inject([get_user().definition(), update_user().definition()])
      .unwrap();

    let targets = registry.resolve_invalidation("updateUser").unwrap();
    assert_eq!(targets, BTreeSet::from(["getUser".to_string()]));

    assert!(matches!(
      registry.resolve_invalidation("getUser"),
      Err(RegistryError::WrongKind { .. })
    ));
    assert!(matches!(
      registry.resolve_invalidation("deleteUser"),
      Err(RegistryError::UnknownEndpoint(_))
    ));
  }

  #[test]
  fn test_invalid_arguments() {
    let definition = get_user().definition();
    let err = definition.build_request(&"not a user").unwrap_err();
    assert!(matches!(err, RegistryError::InvalidArguments { .. }));
  }
}

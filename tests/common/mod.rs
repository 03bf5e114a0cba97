//! Shared fixtures: an in-memory user service behind a scripted executor.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use querycache::{
  CacheConfig, EndpointRegistry, FetchError, FnExecutor, Method, MutationEndpoint, QueryClient,
  QueryEndpoint, RequestDescriptor,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserId {
  pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  pub id: u32,
  pub name: String,
}

pub struct UserService {
  users: Arc<Mutex<HashMap<u32, String>>>,
  reads: Arc<AtomicUsize>,
  gate: Option<Arc<Semaphore>>,
  pub get_user: QueryEndpoint<UserId, User>,
  pub update_user: MutationEndpoint<User, User>,
}

impl UserService {
  /// Service that answers immediately.
  pub fn new() -> Self {
    Self::build(None)
  }

  /// Service that holds every read until [`UserService::respond`] is called.
  pub fn gated() -> Self {
    Self::build(Some(Arc::new(Semaphore::new(0))))
  }

  fn build(gate: Option<Arc<Semaphore>>) -> Self {
    Self {
      users: Arc::new(Mutex::new(HashMap::from([(1, "A".to_string())]))),
      reads: Arc::new(AtomicUsize::new(0)),
      gate,
      get_user: QueryEndpoint::new("getUser", |args: &UserId| {
        RequestDescriptor::get(format!("users/{}", args.id))
      }),
      update_user: MutationEndpoint::new("updateUser", ["getUser"], |user: &User| {
        RequestDescriptor::new(Method::Put, format!("users/{}", user.id))
          .with_body(json!({ "name": user.name }))
      }),
    }
  }

  /// Let one held read complete.
  pub fn respond(&self) {
    if let Some(gate) = &self.gate {
      gate.add_permits(1);
    }
  }

  /// Number of reads that reached the service.
  pub fn reads(&self) -> usize {
    self.reads.load(Ordering::SeqCst)
  }

  pub fn client(&self, config: CacheConfig) -> QueryClient {
    let users = Arc::clone(&self.users);
    let reads = Arc::clone(&self.reads);
    let gate = self.gate.clone();

    let executor = FnExecutor::new(move |request: RequestDescriptor| {
      let users = Arc::clone(&users);
      let reads = Arc::clone(&reads);
      let gate = gate.clone();
      async move {
        if request.method == Method::Get {
          reads.fetch_add(1, Ordering::SeqCst);
          if let Some(gate) = gate {
            gate
              .acquire()
              .await
              .map_err(|_| FetchError::Cancelled)?
              .forget();
          }
        }

        let id: u32 = request
          .url
          .trim_start_matches("users/")
          .parse()
          .map_err(|_| FetchError::Status {
            status: 400,
            body: request.url.clone(),
          })?;

        let mut users = users.lock().unwrap();
        if let Some(name) = request.body.as_ref().and_then(|b| b["name"].as_str()) {
          users.insert(id, name.to_string());
        }
        match users.get(&id) {
          Some(name) => Ok(json!({ "id": id, "name": name })),
          None => Err(FetchError::Status {
            status: 404,
            body: format!("user {id} not found"),
          }),
        }
      }
    });

    let registry = Arc::new(EndpointRegistry::new());
    registry
      .inject([self.get_user.definition(), self.update_user.definition()])
      .unwrap();

    QueryClient::new(registry, Arc::new(executor), config)
  }
}

pub fn user(id: u32, name: &str) -> User {
  User {
    id,
    name: name.to_string(),
  }
}

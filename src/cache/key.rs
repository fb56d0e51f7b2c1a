//! Canonical cache keys and the filters used to invalidate them.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity of one cached query: resource type, operation, optional id and
/// parameters.
///
/// The canonical string is `resource/operation[/id][/params]`, with params
/// rendered as compact JSON with sorted keys. Equal inputs always give equal
/// strings regardless of the order params were added in.
#[derive(Clone)]
pub struct CacheKey {
  resource: String,
  operation: String,
  id: Option<String>,
  params: BTreeMap<String, Value>,
  canonical: String,
}

impl CacheKey {
  pub fn new(resource: impl Into<String>, operation: impl Into<String>) -> Self {
    let mut key = Self {
      resource: resource.into(),
      operation: operation.into(),
      id: None,
      params: BTreeMap::new(),
      canonical: String::new(),
    };
    key.rebuild();
    key
  }

  /// `resource/detail/id`
  pub fn detail(resource: impl Into<String>, id: impl Into<String>) -> Self {
    Self::new(resource, "detail").with_id(id)
  }

  /// `resource/list`
  pub fn list(resource: impl Into<String>) -> Self {
    Self::new(resource, "list")
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = Some(id.into());
    self.rebuild();
    self
  }

  pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.params.insert(name.into(), value.into());
    self.rebuild();
    self
  }

  pub fn resource(&self) -> &str {
    &self.resource
  }

  pub fn operation(&self) -> &str {
    &self.operation
  }

  pub fn id(&self) -> Option<&str> {
    self.id.as_deref()
  }

  pub fn params(&self) -> &BTreeMap<String, Value> {
    &self.params
  }

  pub fn as_str(&self) -> &str {
    &self.canonical
  }

  fn rebuild(&mut self) {
    let mut canonical = format!("{}/{}", self.resource, self.operation);
    if let Some(id) = &self.id {
      canonical.push('/');
      canonical.push_str(id);
    }
    if !self.params.is_empty() {
      canonical.push('/');
      // serde_json maps are sorted, so nested objects are canonical too
      canonical.push_str(&Value::from(serde_json::Map::from_iter(self.params.clone())).to_string());
    }
    self.canonical = canonical;
  }
}

impl PartialEq for CacheKey {
  fn eq(&self, other: &Self) -> bool {
    self.canonical == other.canonical
  }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.canonical.hash(state);
  }
}

impl PartialOrd for CacheKey {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for CacheKey {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    self.canonical.cmp(&other.canonical)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

impl fmt::Debug for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "CacheKey({})", self.canonical)
  }
}

type KeyPredicate = Arc<dyn Fn(&CacheKey) -> bool + Send + Sync>;

/// Selects cache entries for invalidation.
#[derive(Clone)]
pub enum KeyFilter {
  /// One exact key
  Exact(CacheKey),
  /// Every key of a resource type (`analytics/*`)
  Resource(String),
  /// Every key of a resource operation regardless of params (`orders/list/*`)
  Operation { resource: String, operation: String },
  /// Keys of a resource (and optionally operation) accepted by a predicate
  Matching {
    resource: String,
    operation: Option<String>,
    predicate: KeyPredicate,
  },
  /// Everything
  All,
}

impl KeyFilter {
  pub fn resource(resource: impl Into<String>) -> Self {
    Self::Resource(resource.into())
  }

  pub fn operation(resource: impl Into<String>, operation: impl Into<String>) -> Self {
    Self::Operation {
      resource: resource.into(),
      operation: operation.into(),
    }
  }

  pub fn matching(
    resource: impl Into<String>,
    operation: Option<&str>,
    predicate: impl Fn(&CacheKey) -> bool + Send + Sync + 'static,
  ) -> Self {
    Self::Matching {
      resource: resource.into(),
      operation: operation.map(String::from),
      predicate: Arc::new(predicate),
    }
  }

  pub fn matches(&self, key: &CacheKey) -> bool {
    match self {
      Self::Exact(exact) => exact == key,
      Self::Resource(resource) => key.resource == *resource,
      Self::Operation {
        resource,
        operation,
      } => key.resource == *resource && key.operation == *operation,
      Self::Matching {
        resource,
        operation,
        predicate,
      } => {
        key.resource == *resource
          && operation.as_ref().map_or(true, |op| key.operation == *op)
          && predicate(key)
      }
      Self::All => true,
    }
  }
}

impl From<CacheKey> for KeyFilter {
  fn from(key: CacheKey) -> Self {
    Self::Exact(key)
  }
}

impl fmt::Display for KeyFilter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Exact(key) => write!(f, "{}", key),
      Self::Resource(resource) => write!(f, "{}/*", resource),
      Self::Operation {
        resource,
        operation,
      } => write!(f, "{}/{}/*", resource, operation),
      Self::Matching {
        resource,
        operation,
        ..
      } => match operation {
        Some(op) => write!(f, "{}/{}/<predicate>", resource, op),
        None => write!(f, "{}/<predicate>", resource),
      },
      Self::All => f.write_str("*"),
    }
  }
}

impl fmt::Debug for KeyFilter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "KeyFilter({})", self)
  }
}

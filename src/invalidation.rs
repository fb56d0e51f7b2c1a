//! Which cached queries go stale when a mutation settles.
//!
//! [`RULES`] is the one place relationships between resources are written
//! down; every mutation path (direct or replayed from the offline queue)
//! goes through [`InvalidationDispatcher::on_mutation_settled`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::cache::{CacheKey, CacheStore, KeyFilter};

/// Server resource types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
  Quotations,
  Orders,
  Customers,
  Products,
  Analytics,
  Users,
}

impl Resource {
  pub const ALL: [Resource; 6] = [
    Resource::Quotations,
    Resource::Orders,
    Resource::Customers,
    Resource::Products,
    Resource::Analytics,
    Resource::Users,
  ];

  /// Name used in cache keys
  pub fn as_str(&self) -> &'static str {
    match self {
      Resource::Quotations => "quotations",
      Resource::Orders => "orders",
      Resource::Customers => "customers",
      Resource::Products => "products",
      Resource::Analytics => "analytics",
      Resource::Users => "users",
    }
  }

  /// Collection path on the API
  pub fn path(&self) -> String {
    format!("/{}", self.as_str())
  }

  pub fn item_path(&self, id: &str) -> String {
    format!("/{}/{}", self.as_str(), id)
  }

  pub fn detail_key(&self, id: &str) -> CacheKey {
    CacheKey::detail(self.as_str(), id)
  }

  pub fn list_key(&self) -> CacheKey {
    CacheKey::list(self.as_str())
  }
}

impl fmt::Display for Resource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Resource {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Resource::ALL
      .into_iter()
      .find(|r| r.as_str().eq_ignore_ascii_case(s))
      .ok_or_else(|| format!("Unknown resource: {}", s))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      MutationKind::Create => "CREATE",
      MutationKind::Update => "UPDATE",
      MutationKind::Delete => "DELETE",
    };
    f.write_str(s)
  }
}

/// Ids of other resources touched by a mutation, e.g. the quotation an order
/// was converted from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedIds {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub quotation_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub customer_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub order_id: Option<String>,
}

impl RelatedIds {
  pub fn quotation(id: impl Into<String>) -> Self {
    Self {
      quotation_id: Some(id.into()),
      ..Self::default()
    }
  }

  pub fn customer(id: impl Into<String>) -> Self {
    Self {
      customer_id: Some(id.into()),
      ..Self::default()
    }
  }

  pub fn order(id: impl Into<String>) -> Self {
    Self {
      order_id: Some(id.into()),
      ..Self::default()
    }
  }
}

/// Where the id of a detail target comes from.
#[derive(Debug, Clone, Copy)]
enum IdSource {
  Own,
  Quotation,
  Customer,
  Order,
}

#[derive(Debug, Clone, Copy)]
enum Target {
  /// `resource/detail/{id}`, skipped when the id is unknown
  Detail(Resource, IdSource),
  /// `resource/list/*`
  Lists(Resource),
  /// `resource/*`
  Everything(Resource),
}

struct Rule {
  resource: Resource,
  kind: MutationKind,
  targets: &'static [Target],
}

use IdSource::*;
use MutationKind::*;
use Resource::*;
use Target::*;

static RULES: &[Rule] = &[
  Rule {
    resource: Quotations,
    kind: Create,
    targets: &[Lists(Quotations), Detail(Customers, Customer), Everything(Analytics)],
  },
  Rule {
    resource: Quotations,
    kind: Update,
    targets: &[Detail(Quotations, Own), Lists(Quotations), Everything(Analytics)],
  },
  Rule {
    resource: Quotations,
    kind: Delete,
    targets: &[
      Detail(Quotations, Own),
      Lists(Quotations),
      Detail(Customers, Customer),
      // An order converted from the quotation embeds it
      Detail(Orders, Order),
      Everything(Analytics),
    ],
  },
  Rule {
    resource: Orders,
    kind: Create,
    targets: &[
      Lists(Orders),
      Detail(Quotations, Quotation),
      Lists(Quotations),
      Detail(Customers, Customer),
      Everything(Analytics),
    ],
  },
  Rule {
    resource: Orders,
    kind: Update,
    targets: &[Detail(Orders, Own), Lists(Orders), Everything(Analytics)],
  },
  Rule {
    resource: Orders,
    kind: Delete,
    targets: &[
      Detail(Orders, Own),
      Lists(Orders),
      Detail(Quotations, Quotation),
      Everything(Analytics),
    ],
  },
  Rule {
    resource: Customers,
    kind: Create,
    targets: &[Lists(Customers), Everything(Analytics)],
  },
  Rule {
    resource: Customers,
    kind: Update,
    targets: &[
      Detail(Customers, Own),
      Lists(Customers),
      // Lists embed the customer name
      Lists(Quotations),
      Lists(Orders),
    ],
  },
  Rule {
    resource: Customers,
    kind: Delete,
    targets: &[Detail(Customers, Own), Lists(Customers), Everything(Analytics)],
  },
  Rule {
    resource: Products,
    kind: Create,
    targets: &[Lists(Products)],
  },
  Rule {
    resource: Products,
    kind: Update,
    targets: &[Detail(Products, Own), Lists(Products)],
  },
  Rule {
    resource: Products,
    kind: Delete,
    targets: &[Detail(Products, Own), Lists(Products)],
  },
  Rule {
    resource: Users,
    kind: Create,
    targets: &[Lists(Users)],
  },
  Rule {
    resource: Users,
    kind: Update,
    targets: &[Detail(Users, Own), Lists(Users)],
  },
  Rule {
    resource: Users,
    kind: Delete,
    targets: &[Detail(Users, Own), Lists(Users)],
  },
];

/// Filters to invalidate for one settled mutation.
pub fn filters_for(
  resource: Resource,
  kind: MutationKind,
  resource_id: Option<&str>,
  related: &RelatedIds,
) -> Vec<KeyFilter> {
  let Some(rule) = RULES
    .iter()
    .find(|r| r.resource == resource && r.kind == kind)
  else {
    // Analytics is read-only; nothing depends on it
    return Vec::new();
  };

  rule
    .targets
    .iter()
    .filter_map(|target| match *target {
      Detail(res, source) => {
        let id = match source {
          Own => resource_id,
          Quotation => related.quotation_id.as_deref(),
          Customer => related.customer_id.as_deref(),
          Order => related.order_id.as_deref(),
        }?;
        Some(KeyFilter::Exact(res.detail_key(id)))
      }
      Lists(res) => Some(KeyFilter::operation(res.as_str(), "list")),
      Everything(res) => Some(KeyFilter::resource(res.as_str())),
    })
    .collect()
}

/// Marks dependent cache entries stale after mutations.
#[derive(Clone)]
pub struct InvalidationDispatcher {
  cache: CacheStore,
}

impl InvalidationDispatcher {
  pub fn new(cache: CacheStore) -> Self {
    Self { cache }
  }

  /// Invalidate everything the mutation affects. Returns the keys that were
  /// marked stale, sorted and deduplicated.
  pub fn on_mutation_settled(
    &self,
    resource: Resource,
    kind: MutationKind,
    resource_id: Option<&str>,
    related: &RelatedIds,
  ) -> Vec<CacheKey> {
    let mut stale: Vec<CacheKey> = filters_for(resource, kind, resource_id, related)
      .into_iter()
      .flat_map(|filter| self.cache.invalidate(filter))
      .collect();
    stale.sort();
    stale.dedup();

    debug!(
      resource = %resource,
      kind = %kind,
      id = resource_id.unwrap_or("-"),
      invalidated = stale.len(),
      "Mutation settled"
    );
    stale
  }
}

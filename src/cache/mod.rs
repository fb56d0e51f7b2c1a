//! Query cache for server-derived data.
//!
//! - Entries are addressed by canonical [`CacheKey`]s
//! - Staleness is tracked per entry; invalidation marks stale without deleting
//! - Fetches are read-through and a late result never overwrites newer data
//! - Observers are notified of every state transition of their key

mod key;
mod list;
mod store;

pub use key::{CacheKey, KeyFilter};
pub use list::ListShape;
pub use store::{
  CacheEvent, CacheEventKind, CacheOptions, CacheStore, EntryInfo, Fetcher, Listener, QueryStatus,
  SetOptions, Subscription,
};

pub(crate) use store::{EntrySnapshot, UpdateFn};

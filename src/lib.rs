//! Client-side data synchronization for a quotation/order REST API.
//!
//! - [`transport`]: authenticated requests, error classification, retry and
//!   single-flight token refresh
//! - [`cache`]: keyed query cache with staleness, invalidation and observers
//! - [`optimistic`]: optimistic writes with exact rollback
//! - [`invalidation`]: which queries go stale after a mutation
//! - [`offline`]: durable queue of mutations made while offline
//! - [`client`]: all of the above behind [`SyncClient`]

pub mod cache;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod invalidation;
pub mod logging;
pub mod offline;
pub mod optimistic;
pub mod storage;
pub mod transport;

pub use client::{MutationOutcome, SyncClient};
pub use config::Config;
pub use error::{ApiError, ApiResult, ErrorKind};

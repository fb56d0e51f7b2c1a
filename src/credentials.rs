//! Access/refresh token pair shared by every outgoing request.

use color_eyre::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::storage::{keys, PersistentStore};

/// The current token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
  pub access_token: String,
  pub refresh_token: String,
}

/// Process-wide credential holder.
///
/// Cloning shares the same underlying pair. Requests only read it; the refresh
/// coordinator is the only writer once the session is running. `init` loads
/// the persisted pair at startup and `clear` wipes it on logout.
#[derive(Clone)]
pub struct CredentialStore {
  current: Arc<RwLock<Option<CredentialPair>>>,
  storage: Arc<dyn PersistentStore>,
}

impl CredentialStore {
  /// Create an empty store backed by `storage`. Call [`init`](Self::init) to load.
  pub fn new(storage: Arc<dyn PersistentStore>) -> Self {
    Self {
      current: Arc::new(RwLock::new(None)),
      storage,
    }
  }

  /// Load the persisted pair. Missing tokens leave the store empty.
  pub fn init(&self) -> Result<()> {
    let access = self.storage.load(keys::ACCESS_TOKEN)?;
    let refresh = self.storage.load(keys::REFRESH_TOKEN)?;

    let pair = match (access, refresh) {
      (Some(access_token), Some(refresh_token)) => Some(CredentialPair {
        access_token,
        refresh_token,
      }),
      (None, None) => None,
      _ => {
        warn!("Persisted credentials incomplete, ignoring");
        None
      }
    };

    debug!(signed_in = pair.is_some(), "Credentials loaded");
    *self.current.write() = pair;
    Ok(())
  }

  /// Install a pair obtained by the application's sign-in flow.
  pub fn install(&self, pair: CredentialPair) -> Result<()> {
    self.replace(pair)
  }

  /// Replace the pair after a successful refresh.
  pub(crate) fn replace(&self, pair: CredentialPair) -> Result<()> {
    self.storage.save(keys::ACCESS_TOKEN, &pair.access_token)?;
    self.storage.save(keys::REFRESH_TOKEN, &pair.refresh_token)?;
    *self.current.write() = Some(pair);
    Ok(())
  }

  /// Forget the pair in memory and in storage.
  pub fn clear(&self) -> Result<()> {
    *self.current.write() = None;
    self.storage.remove(keys::ACCESS_TOKEN)?;
    self.storage.remove(keys::REFRESH_TOKEN)?;
    Ok(())
  }

  pub fn access_token(&self) -> Option<String> {
    self.current.read().as_ref().map(|p| p.access_token.clone())
  }

  pub fn refresh_token(&self) -> Option<String> {
    self.current.read().as_ref().map(|p| p.refresh_token.clone())
  }

  pub fn is_signed_in(&self) -> bool {
    self.current.read().is_some()
  }
}

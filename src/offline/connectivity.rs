use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared online/offline flag.
///
/// The client flips it from transport outcomes; anything can watch it.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the current state. Returns true if it changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });
    if changed {
      info!(online, "Connectivity changed");
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_transitions_are_observed_once() {
    let connectivity = Connectivity::default();
    let mut rx = connectivity.subscribe();

    assert!(!connectivity.set_online(true));
    assert!(!rx.has_changed().unwrap());

    assert!(connectivity.set_online(false));
    rx.changed().await.unwrap();
    assert!(!*rx.borrow_and_update());
    assert!(!connectivity.is_online());
  }
}

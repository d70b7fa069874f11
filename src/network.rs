//! Network connectivity observation.
//!
//! The accessor reads the current status and, when the source supports it,
//! a watch channel of transitions. Sources without transitions are fine:
//! without any source the accessor assumes it is online.

use tokio::sync::watch;
use tracing::debug;

pub trait NetworkStatus: Send + Sync {
  fn is_online(&self) -> bool;

  /// Receiver of online/offline transitions, if this source produces them.
  fn subscribe(&self) -> Option<watch::Receiver<bool>>;
}

/// Used when no connectivity information is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeOnline;

impl NetworkStatus for AssumeOnline {
  fn is_online(&self) -> bool {
    true
  }

  fn subscribe(&self) -> Option<watch::Receiver<bool>> {
    None
  }
}

/// Connectivity state fed by whoever can observe the network
/// (a probe task, the host platform, a test).
#[derive(Debug)]
pub struct NetworkMonitor {
  tx: watch::Sender<bool>,
}

impl NetworkMonitor {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  /// Record the current status. Repeating the current value notifies nobody.
  /// Returns whether the status changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      debug!(online, "Network status changed");
    }
    changed
  }
}

impl NetworkStatus for NetworkMonitor {
  fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  fn subscribe(&self) -> Option<watch::Receiver<bool>> {
    Some(self.tx.subscribe())
  }
}

pub(crate) mod http;
pub(crate) mod sni;
pub(crate) mod tcp;
pub(crate) mod udp;

use crate::config::{EntryPoint, RoutingKind};
use std::{collections::HashMap, sync::Mutex};

/* ---------------------------------------------------------- */
#[derive(Debug, Default)]
/// Registry of tag groups, owned by the supervisor and shared by reference.
///
/// A group collects every entry registered under the same `(routing, tag)` key
/// in registration order. The first registrant owns the shared listener; the
/// others only contribute their matchers and targets to per-flow selection.
pub struct TagRegistry {
  inner: Mutex<HashMap<(RoutingKind, String), Vec<EntryPoint>>>,
}

impl TagRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register an entry into its group. Returns true when the entry is the
  /// first of the group and must bind the listener.
  pub(crate) fn register(&self, entry: &EntryPoint) -> bool {
    let Some(tag) = entry.tag.clone() else {
      return true;
    };
    let mut inner = self.inner.lock().expect("tag registry poisoned");
    let group = inner.entry((entry.routing, tag)).or_default();
    group.push(entry.clone());
    group.len() == 1
  }

  /// Snapshot of the group an entry belongs to, in registration order.
  /// Entries without a tag yield an empty snapshot.
  pub(crate) fn group(&self, entry: &EntryPoint) -> Vec<EntryPoint> {
    let Some(tag) = entry.tag.clone() else {
      return Vec::new();
    };
    let inner = self.inner.lock().expect("tag registry poisoned");
    inner.get(&(entry.routing, tag)).cloned().unwrap_or_default()
  }

  /// Select the effective entry for a flow: the first group member whose
  /// matchers admit the name, or the owning entry itself when untagged.
  pub(crate) fn select<'a>(&self, owner: &'a EntryPoint, name: &str) -> Option<EntryPoint> {
    if owner.tag.is_none() {
      return owner.allowed(name).then(|| owner.clone());
    }
    self.group(owner).into_iter().find(|e| e.allowed(name))
  }

  /// Drop every group. Called between supervisor generations.
  pub fn reset(&self) {
    self.inner.lock().expect("tag registry poisoned").clear();
  }
}

/* ---------------------------------------------------------- */

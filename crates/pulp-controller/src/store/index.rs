use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tracing::warn;

/// `(namespace, name)` of an object.
pub type ObjectKey = (String, String);

/// Maps a referenced Secret/ConfigMap to the Pulp instances whose spec names it,
/// so an event on the dependency can be routed back to its consumers.
#[derive(Clone, Default, Debug)]
pub struct ReverseIndex {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default, Debug)]
struct Inner {
    by_ref: BTreeMap<ObjectKey, BTreeSet<ObjectKey>>,
    by_owner: BTreeMap<ObjectKey, BTreeSet<ObjectKey>>,
}

impl ReverseIndex {
    /// Replace the set of objects `owner` references.
    pub fn update<I, S>(&self, owner: &ObjectKey, refs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let refs: BTreeSet<ObjectKey> = refs
            .into_iter()
            .map(|name| (owner.0.clone(), name.into()))
            .collect();
        let mut inner = self.write();
        inner.drop_owner(owner);
        for r in &refs {
            inner
                .by_ref
                .entry(r.clone())
                .or_default()
                .insert(owner.clone());
        }
        inner.by_owner.insert(owner.clone(), refs);
    }

    pub fn remove(&self, owner: &ObjectKey) {
        self.write().drop_owner(owner);
    }

    /// Instances referencing `(namespace, name)`.
    pub fn owners_of(&self, namespace: &str, name: &str) -> Vec<ObjectKey> {
        let key = (namespace.to_string(), name.to_string());
        self.read()
            .by_ref
            .get(&key)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| {
            warn!("reverse index lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| {
            warn!("reverse index lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Inner {
    fn drop_owner(&mut self, owner: &ObjectKey) {
        if let Some(previous) = self.by_owner.remove(owner) {
            for r in previous {
                if let Some(owners) = self.by_ref.get_mut(&r) {
                    owners.remove(owner);
                    if owners.is_empty() {
                        self.by_ref.remove(&r);
                    }
                }
            }
        }
    }
}

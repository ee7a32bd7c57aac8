//! Per-GVK informer cache, populated by the watches the controller engine
//! (`crate::engine`) starts and stops.
//!
//! Grounded in the pack's `kube-runtime/src/reflector/{mod,store}.rs`: each
//! GVK gets its own `reflector::Store<DynamicObject>`, kept in a concurrent
//! map keyed by `Gvk` rather than the single static store a one-CRD operator
//! needs.

use std::sync::Arc;

use dashmap::DashMap;
use kube::api::DynamicObject;
use kube::runtime::reflector::{self, ObjectRef, Store};

use crate::types::Gvk;

/// Holds one reflector `Store` per GVK currently being watched by any
/// controller. Looking an object up by name, or listing everything indexed
/// under a GVK, never hits the API server — only the watch stream mutates
/// these stores. Wrapped in an `Arc` so every clone (handed to each
/// controller's watch tasks) shares the same underlying map rather than
/// forking it.
#[derive(Clone, Default)]
pub struct Cache {
    stores: Arc<DashMap<Gvk, Store<DynamicObject>>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh, empty store for `gvk` and returns its writer half.
    /// The caller (the controller engine, when starting a watch) feeds the
    /// writer from the watch stream via `reflector::reflector`.
    pub fn register(&self, gvk: Gvk) -> reflector::store::Writer<DynamicObject> {
        let writer = reflector::store::Writer::default();
        self.stores.insert(gvk, writer.as_reader());
        writer
    }

    pub fn unregister(&self, gvk: &Gvk) {
        self.stores.remove(gvk);
    }

    pub fn is_registered(&self, gvk: &Gvk) -> bool {
        self.stores.contains_key(gvk)
    }

    /// Looks up a single cached object by name (and namespace, for
    /// namespaced kinds). Returns `None` on a cache miss — callers that need
    /// a guaranteed-fresh read should go through `KindClient::get` instead.
    pub fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Option<std::sync::Arc<DynamicObject>> {
        let store = self.stores.get(gvk)?;
        let key = if gvk.namespaced {
            ObjectRef::new_with(name, Default::default()).within(namespace.unwrap_or_default())
        } else {
            ObjectRef::new_with(name, Default::default())
        };
        store.get(&key)
    }

    /// All objects currently cached for `gvk`.
    pub fn list(&self, gvk: &Gvk) -> Vec<std::sync::Arc<DynamicObject>> {
        match self.stores.get(gvk) {
            Some(store) => store.state(),
            None => Vec::new(),
        }
    }

    pub fn gvks(&self) -> Vec<Gvk> {
        self.stores.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn gvk() -> Gvk {
        Gvk::new("example.org", "v1", "Bucket", "buckets", true)
    }

    #[test]
    fn register_then_unregister_clears_cache() {
        let cache = Cache::new();
        cache.register(gvk());
        assert!(cache.is_registered(&gvk()));
        cache.unregister(&gvk());
        assert!(!cache.is_registered(&gvk()));
    }

    #[test]
    fn list_on_unknown_gvk_is_empty() {
        let cache = Cache::new();
        assert!(cache.list(&gvk()).is_empty());
    }
}

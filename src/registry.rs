//! Role Registry: name and role index over live driver proxies.
//!
//! Proxies are owned by the lifecycle orchestrator; the registry only keeps
//! [`Weak`] references, so a proxy dropped during shutdown disappears from
//! lookups even before it is deregistered.
//!
//! Initialization workers insert concurrently while consumers read. Each name is
//! written by exactly one worker, so a plain [`RwLock`] is enough: once
//! [`register`](RoleRegistry::register) returns, every later lookup sees the
//! proxy.

use crate::component::Role;
use crate::driver::{Capability, DriverProxy};
use crate::error::{ModelError, ModelResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::debug;

#[derive(Default)]
struct Index {
    by_name: BTreeMap<String, Weak<DriverProxy>>,
    by_role: HashMap<Role, BTreeSet<String>>,
}

/// Concurrent lookup table populated as components come up.
#[derive(Default)]
pub struct RoleRegistry {
    index: RwLock<Index>,
}

impl std::fmt::Debug for RoleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live proxy under its name and role.
    ///
    /// Re-registering a name replaces the previous entry.
    pub fn register(&self, proxy: &Arc<DriverProxy>) {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let name = proxy.name().to_string();
        if let Some(previous) = index.by_name.insert(name.clone(), Arc::downgrade(proxy)) {
            if let Some(previous) = previous.upgrade() {
                if let Some(names) = index.by_role.get_mut(previous.role()) {
                    names.remove(&name);
                }
            }
        }
        index
            .by_role
            .entry(proxy.role().clone())
            .or_default()
            .insert(name.clone());
        debug!(component = %name, role = %proxy.role(), "registered");
    }

    /// Remove a component. Returns true if it was registered.
    pub fn deregister(&self, name: &str) -> bool {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let removed = index.by_name.remove(name).is_some();
        index.by_role.retain(|_, names| {
            names.remove(name);
            !names.is_empty()
        });
        removed
    }

    /// Live proxy with the given name.
    pub fn lookup_by_name(&self, name: &str) -> ModelResult<Arc<DriverProxy>> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index
            .by_name
            .get(name)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ModelError::NotFound(name.to_string()))
    }

    /// Every live proxy registered under `role`, ordered by name.
    ///
    /// Unknown roles yield an empty list.
    pub fn lookup_by_role(&self, role: &str) -> Vec<Arc<DriverProxy>> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index
            .by_role
            .get(&Role::new(role))
            .into_iter()
            .flatten()
            .filter_map(|name| index.by_name.get(name).and_then(Weak::upgrade))
            .collect()
    }

    /// Every live proxy advertising `capability`, ordered by name.
    pub fn lookup_by_capability(&self, capability: Capability) -> Vec<Arc<DriverProxy>> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index
            .by_name
            .values()
            .filter_map(Weak::upgrade)
            .filter(|proxy| proxy.has_capability(capability))
            .collect()
    }

    /// Names of the live proxies, sorted.
    pub fn names(&self) -> Vec<String> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index
            .by_name
            .iter()
            .filter(|(_, proxy)| proxy.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

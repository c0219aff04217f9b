//! Component registry boundary
//!
//! The lock manager consults the registry only to learn whether a component
//! is shared, which decides between local and lease-backed locking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// What the lock manager needs to know about a component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub id: String,
    pub owner: String,
    /// Whether the component is visible to other sessions
    pub shared: bool,
}

impl ComponentInfo {
    pub fn private(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            shared: false,
        }
    }

    pub fn shared(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            shared: true,
        }
    }
}

/// Lookup of components by id
pub trait ComponentRegistry: Send + Sync {
    fn lookup(&self, component_id: &str) -> Option<ComponentInfo>;

    /// Unknown components are treated as private
    fn is_shared(&self, component_id: &str) -> bool {
        self.lookup(component_id).map(|c| c.shared).unwrap_or(false)
    }
}

/// Registry kept in memory, used by tests and the CLI
#[derive(Debug, Default)]
pub struct InMemoryComponentRegistry {
    components: RwLock<HashMap<String, ComponentInfo>>,
}

impl InMemoryComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a component
    pub fn insert(&self, component: ComponentInfo) {
        if let Ok(mut components) = self.components.write() {
            components.insert(component.id.clone(), component);
        }
    }

    /// Mark a component as shared (its owner published it)
    pub fn publish(&self, component_id: &str) -> bool {
        match self.components.write() {
            Ok(mut components) => match components.get_mut(component_id) {
                Some(component) => {
                    component.shared = true;
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn remove(&self, component_id: &str) -> Option<ComponentInfo> {
        self.components
            .write()
            .ok()
            .and_then(|mut components| components.remove(component_id))
    }
}

impl ComponentRegistry for InMemoryComponentRegistry {
    fn lookup(&self, component_id: &str) -> Option<ComponentInfo> {
        self.components
            .read()
            .ok()
            .and_then(|components| components.get(component_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_shared_flag() {
        let registry = InMemoryComponentRegistry::new();
        registry.insert(ComponentInfo::private("c1", "alice"));
        registry.insert(ComponentInfo::shared("c2", "bob"));

        assert!(!registry.is_shared("c1"));
        assert!(registry.is_shared("c2"));
        assert!(!registry.is_shared("missing"));
        assert_eq!(registry.lookup("c2").unwrap().owner, "bob");
    }

    #[test]
    fn test_publish() {
        let registry = InMemoryComponentRegistry::new();
        registry.insert(ComponentInfo::private("c1", "alice"));

        assert!(registry.publish("c1"));
        assert!(registry.is_shared("c1"));
        assert!(!registry.publish("missing"));
    }

    #[test]
    fn test_remove() {
        let registry = InMemoryComponentRegistry::new();
        registry.insert(ComponentInfo::private("c1", "alice"));

        assert!(registry.remove("c1").is_some());
        assert!(registry.lookup("c1").is_none());
    }
}

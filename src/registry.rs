//! Plugin registry and discovery.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Result;
use crate::plugin::PluginFactory;

/// The `available_plugins` snapshot a watch is constructed with. Factories
/// are shared; the map itself is owned by the watch.
pub type PluginSet = HashMap<String, Arc<dyn PluginFactory>>;

/// Registry of plugin factories keyed by name.
///
/// The observer re-scans its [`PluginDiscovery`] when the plugin directory
/// changes; an updated factory registered under an existing name becomes
/// visible to a watch at its next reconfiguration cycle, when the observer
/// publishes a fresh [`snapshot`](PluginRegistry::snapshot).
pub struct PluginRegistry {
    factories: DashMap<String, Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// Register (or replace) a factory under `name`.
    pub fn register(&self, name: impl Into<String>, factory: Arc<dyn PluginFactory>) {
        let name = name.into();
        tracing::debug!("registering plugin '{}'", name);
        self.factories.insert(name, factory);
    }

    /// Remove the factory under `name`. Returns whether one was present.
    pub fn deregister(&self, name: &str) -> bool {
        self.factories.remove(name).is_some()
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// All registered plugin names.
    pub fn names(&self) -> Vec<String> {
        self.factories.iter().map(|r| r.key().clone()).collect()
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// An owned snapshot of the current name → factory map.
    pub fn snapshot(&self) -> PluginSet {
        self.factories
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

/// Populates a [`PluginRegistry`], and re-populates it when the observer
/// detects a change in the plugin directory.
///
/// The crate ships [`BuiltinPlugins`]; an embedder loading plugin code
/// dynamically supplies its own implementation and hands it to
/// [`ObserverBuilder::discovery`](crate::ObserverBuilder::discovery).
pub trait PluginDiscovery: Send + Sync {
    /// Scan for plugins and register every one found, replacing factories
    /// already registered under the same name. Must be idempotent.
    fn scan(&self, registry: &PluginRegistry) -> Result<()>;
}

/// The default discovery: registers the built-in `mirror` and `scribe`
/// plugins.
#[derive(Debug, Default)]
pub struct BuiltinPlugins;

impl PluginDiscovery for BuiltinPlugins {
    fn scan(&self, registry: &PluginRegistry) -> Result<()> {
        crate::plugins::register_builtin(registry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use crate::event::Event;
    use crate::plugin::{HostContext, Plugin};

    struct Nop;

    impl Plugin for Nop {
        fn process_event(&mut self, _event: &Event) -> std::result::Result<(), PluginError> {
            Ok(())
        }
    }

    fn nop_factory() -> Arc<dyn PluginFactory> {
        Arc::new(|_host: HostContext| Box::new(Nop) as Box<dyn Plugin>)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = PluginRegistry::new();
        assert!(registry.is_empty());

        registry.register("scribe", nop_factory());
        assert!(registry.contains("scribe"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["scribe".to_string()]);
    }

    #[test]
    fn test_register_replaces() {
        let registry = PluginRegistry::new();
        registry.register("scribe", nop_factory());
        registry.register("scribe", nop_factory());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deregister() {
        let registry = PluginRegistry::new();
        registry.register("scribe", nop_factory());
        assert!(registry.deregister("scribe"));
        assert!(!registry.deregister("scribe"));
        assert!(!registry.contains("scribe"));
    }

    #[test]
    fn test_snapshot_is_independent() {
        let registry = PluginRegistry::new();
        registry.register("scribe", nop_factory());
        let snapshot = registry.snapshot();

        registry.deregister("scribe");
        assert!(snapshot.contains_key("scribe"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_builtin_scan_idempotent() {
        let registry = PluginRegistry::new();
        BuiltinPlugins.scan(&registry).unwrap();
        let first = registry.len();
        assert!(registry.contains("mirror"));
        assert!(registry.contains("scribe"));

        BuiltinPlugins.scan(&registry).unwrap();
        assert_eq!(registry.len(), first);
    }
}

//! Plugin host interface.
//!
//! A plugin is a stateless event handler. The host instantiates one per
//! event delivery through a [`PluginFactory`], hands it the event, and drops
//! it, so a freshly re-registered factory takes effect on the very
//! next event. State that must survive between deliveries belongs in the
//! shared [`Cache`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::Cache;
use crate::error::PluginError;
use crate::event::Event;
use crate::settings::Setting;

/// The configuration slice a plugin receives: every watch option whose key
/// starts with `<plugin-name>_`.
pub type PluginConfig = BTreeMap<String, Setting>;

/// Everything a plugin is constructed with.
pub struct HostContext {
    /// Root path of the watch that is dispatching the event.
    pub watch_path: PathBuf,
    /// The observer-wide shared cache.
    pub cache: Arc<Cache>,
    /// This plugin's configuration slice.
    pub config: PluginConfig,
}

impl HostContext {
    /// Look up an option from the slice as a string.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Setting::as_str)
    }

    /// Like [`config_str`](Self::config_str), erring with a "missing
    /// directive" message when the option is absent.
    pub fn require_str(&self, key: &str) -> Result<&str, PluginError> {
        self.config_str(key)
            .ok_or_else(|| PluginError::new(format!("missing {key} directive")))
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("watch_path", &self.watch_path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A plugin instance bound to one event delivery.
pub trait Plugin: Send {
    /// Handle one event. An `Err` is captured by the owning watch and does
    /// not interrupt dispatch to the remaining plugins.
    fn process_event(&mut self, event: &Event) -> Result<(), PluginError>;
}

/// Constructs plugin instances. Registered in the [`PluginRegistry`]
/// under the plugin's name.
///
/// Any `Fn(HostContext) -> Box<dyn Plugin>` closure is a factory:
///
/// ```ignore
/// registry.register("scribe", Arc::new(|host| Box::new(Scribe::new(host)) as Box<dyn Plugin>));
/// ```
///
/// [`PluginRegistry`]: crate::PluginRegistry
pub trait PluginFactory: Send + Sync {
    /// Create an instance for one event delivery.
    fn instantiate(&self, host: HostContext) -> Box<dyn Plugin>;
}

impl<F> PluginFactory for F
where
    F: Fn(HostContext) -> Box<dyn Plugin> + Send + Sync,
{
    fn instantiate(&self, host: HostContext) -> Box<dyn Plugin> {
        self(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Nop;

    impl Plugin for Nop {
        fn process_event(&mut self, _event: &Event) -> Result<(), PluginError> {
            Ok(())
        }
    }

    fn host(config: PluginConfig) -> HostContext {
        HostContext {
            watch_path: PathBuf::from("/srv/data"),
            cache: Arc::new(Cache::new(Duration::from_secs(10), 100)),
            config,
        }
    }

    #[test]
    fn test_closure_factory() {
        let factory: Arc<dyn PluginFactory> =
            Arc::new(|_host: HostContext| Box::new(Nop) as Box<dyn Plugin>);
        let mut plugin = factory.instantiate(host(PluginConfig::new()));
        let event = Event::synthetic(crate::EventKind::WatchInit, "/srv/data");
        assert!(plugin.process_event(&event).is_ok());
    }

    #[test]
    fn test_require_str() {
        let mut config = PluginConfig::new();
        config.insert("scribe_log".into(), Setting::from("-"));
        let ctx = host(config);
        assert_eq!(ctx.require_str("scribe_log").unwrap(), "-");

        let err = ctx.require_str("scribe_missing").unwrap_err();
        assert_eq!(err.to_string(), "missing scribe_missing directive");
    }
}

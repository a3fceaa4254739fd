//! The observer supervisor.
//!
//! The observer owns the shared cache, the plugin registry, the set of live
//! watches, and up to two self-watches: a poll watch on its own
//! configuration file and a kernel watch on the plugin directory. Its
//! thread sleeps on a bounded wait and reacts to four flags: terminate,
//! error, plugins-changed and config-changed. The self-watches drive the
//! latter two through a sentinel pseudo-plugin, so configuration and plugin
//! changes reconfigure the running supervisor in place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::flag::Flag;
use crate::plugin::{HostContext, Plugin};
use crate::registry::{BuiltinPlugins, PluginDiscovery, PluginRegistry, PluginSet};
use crate::settings::{canonical, RawSettings, Settings, WatchSettings};
use crate::source::default_source_factory;
use crate::watch::{Watch, TICK};

/// Shared, non-owning view of the observer that worker threads report
/// through. Watches hold one; it never determines the observer's lifetime.
pub(crate) struct ObserverHandle {
    pub(crate) terminate: Flag,
    pub(crate) error: Flag,
    pub(crate) config_changed: Flag,
    pub(crate) plugins_changed: Flag,
    last_error: Mutex<Option<String>>,
}

impl ObserverHandle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            terminate: Flag::new(),
            error: Flag::new(),
            config_changed: Flag::new(),
            plugins_changed: Flag::new(),
            last_error: Mutex::new(None),
        })
    }

    /// Record an error raised in any thread. The observer's error flag is
    /// set only for fatal (observer-level) errors; watch and plugin errors
    /// leave the supervisor running.
    pub(crate) fn report(&self, err: &Error) {
        if err.is_plugin() {
            tracing::warn!("{err}");
        } else {
            tracing::error!("{err}");
        }
        *self.last_error.lock() = Some(err.to_string());
        if err.is_fatal() {
            self.error.set();
        }
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

/// The observer acting as a plugin on its own self-watches.
///
/// Filters to the event kinds that mean "the watched file set changed",
/// ignores dotfiles and editor droppings, and routes: an event on the known
/// config path raises the config-changed flag, anything else the
/// plugins-changed flag.
struct Sentinel {
    handle: Arc<ObserverHandle>,
    config_path: Option<PathBuf>,
}

impl Plugin for Sentinel {
    fn process_event(&mut self, event: &Event) -> std::result::Result<(), crate::PluginError> {
        use EventKind::*;
        if !matches!(
            event.kind,
            Create | Delete | DeleteSelf | Modify | MoveSelf | MovedFrom | MovedTo
        ) {
            return Ok(());
        }
        if let Some(name) = &event.name {
            let name = name.to_string_lossy();
            if name.starts_with('.')
                || name.ends_with('~')
                || name.ends_with(".swp")
                || name.ends_with(".tmp")
            {
                return Ok(());
            }
        }
        if self.config_path.as_deref() == Some(event.path.as_path()) {
            self.handle.config_changed.set();
        } else {
            self.handle.plugins_changed.set();
        }
        Ok(())
    }
}

/// An `available_plugins` set containing only a sentinel under `name`.
fn sentinel_set(handle: &Arc<ObserverHandle>, config_path: Option<PathBuf>, name: &str) -> PluginSet {
    let handle = handle.clone();
    let factory = Arc::new(move |_host: HostContext| {
        Box::new(Sentinel {
            handle: handle.clone(),
            config_path: config_path.clone(),
        }) as Box<dyn Plugin>
    });
    let mut set = PluginSet::new();
    set.insert(name.to_string(), factory);
    set
}

/// Builder for [`Observer`].
pub struct ObserverBuilder {
    raw: Option<RawSettings>,
    config_file: Option<PathBuf>,
    plugin_dir: Option<PathBuf>,
    discovery: Arc<dyn PluginDiscovery>,
    cache_max_age: Duration,
    cache_purge_interval: usize,
}

impl ObserverBuilder {
    /// Start from defaults: built-in plugins, no config file, a 10 second /
    /// 100 push cache.
    pub fn new() -> Self {
        Self {
            raw: None,
            config_file: None,
            plugin_dir: None,
            discovery: Arc::new(BuiltinPlugins),
            cache_max_age: Duration::from_secs(10),
            cache_purge_interval: 100,
        }
    }

    /// Supply an inline configuration mapping.
    pub fn settings(mut self, raw: RawSettings) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Supply a configuration file path. The file is read at build time and
    /// re-read whenever the config self-watch reports a change.
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// The directory the `watch_plugins` self-watch observes.
    pub fn plugin_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.plugin_dir = Some(path.into());
        self
    }

    /// Replace the plugin discovery hook.
    pub fn discovery(mut self, discovery: Arc<dyn PluginDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    /// Set the cache entry time-to-live.
    pub fn cache_max_age(mut self, max_age: Duration) -> Self {
        self.cache_max_age = max_age;
        self
    }

    /// Set the cache purge interval, in pushes.
    pub fn cache_purge_interval(mut self, pushes: usize) -> Self {
        self.cache_purge_interval = pushes;
        self
    }

    /// Build the observer. Configuration and plugin-scan failures surface
    /// here, synchronously.
    pub fn build(self) -> Result<Observer> {
        let mut settings = Settings::default();
        if let Some(raw) = self.raw {
            settings.merge(raw)?;
        }
        let config_path = match self.config_file {
            Some(path) => {
                let path = canonical(&path);
                settings.merge(RawSettings::from_file(&path)?)?;
                Some(path)
            }
            None => None,
        };

        let registry = Arc::new(PluginRegistry::new());
        self.discovery.scan(&registry)?;

        Ok(Observer {
            handle: ObserverHandle::new(),
            cache: Arc::new(Cache::new(self.cache_max_age, self.cache_purge_interval)),
            registry,
            discovery: self.discovery,
            settings,
            config_path,
            plugin_dir: self.plugin_dir.map(|dir| canonical(&dir)),
            thread: None,
        })
    }
}

impl Default for ObserverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The top-level supervisor.
///
/// Created and configured eagerly (construction errors are synchronous),
/// started once, stopped once. While running, errors from any thread are
/// recorded and readable via [`error`](Observer::error); fatal ones stop
/// every watch and the observer itself, so the supervisor never dies
/// silently.
pub struct Observer {
    handle: Arc<ObserverHandle>,
    cache: Arc<Cache>,
    registry: Arc<PluginRegistry>,
    discovery: Arc<dyn PluginDiscovery>,
    settings: Settings,
    config_path: Option<PathBuf>,
    plugin_dir: Option<PathBuf>,
    thread: Option<JoinHandle<()>>,
}

impl Observer {
    /// An observer over the default configuration.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// An observer configured from an inline mapping.
    pub fn with_settings(raw: RawSettings) -> Result<Self> {
        Self::builder().settings(raw).build()
    }

    /// An observer configured from a file.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        Self::builder().config_file(path).build()
    }

    /// A builder with all the knobs.
    pub fn builder() -> ObserverBuilder {
        ObserverBuilder::new()
    }

    /// The merged configuration as of construction.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The shared cache.
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// The plugin registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// A snapshot of the registry, suitable for [`attach_watch`](Self::attach_watch).
    pub fn plugins(&self) -> PluginSet {
        self.registry.snapshot()
    }

    /// The last surfaced error message, if any.
    pub fn error(&self) -> Option<String> {
        self.handle.last_error()
    }

    /// Whether the observer thread is running.
    pub fn is_alive(&self) -> bool {
        self.thread
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Construct (but do not start) a kernel watch bound to this observer.
    ///
    /// The watch shares the observer's cache and reports errors to it; it is
    /// otherwise driven by the caller. Used standalone and by the observer
    /// loop itself.
    pub fn attach_watch(
        &self,
        path: impl AsRef<Path>,
        available: PluginSet,
        settings: WatchSettings,
    ) -> Watch {
        Watch::kernel(
            self.handle.clone(),
            self.cache.clone(),
            available,
            canonical(path.as_ref()),
            settings,
            default_source_factory(),
        )
    }

    /// Construct (but do not start) a poll watch on a single file.
    pub fn attach_poll_watch(
        &self,
        path: impl AsRef<Path>,
        available: PluginSet,
        settings: WatchSettings,
    ) -> Watch {
        Watch::poll(
            self.handle.clone(),
            self.cache.clone(),
            available,
            canonical(path.as_ref()),
            settings,
        )
    }

    /// Start the observer thread.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::observer("observer already started"));
        }
        let core = Core {
            handle: self.handle.clone(),
            cache: self.cache.clone(),
            registry: self.registry.clone(),
            discovery: self.discovery.clone(),
            settings: self.settings.clone(),
            config_path: self.config_path.clone(),
            plugin_dir: self.plugin_dir.clone(),
            watches: HashMap::new(),
            config_watch: None,
            plugins_watch: None,
        };
        let handle = std::thread::Builder::new()
            .name("vigil-observer".to_string())
            .spawn(move || core.run())
            .map_err(|err| Error::observer(format!("could not start observer thread: {err}")))?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Stop the observer: every watch and both self-watches are stopped and
    /// joined before this returns.
    pub fn stop(&mut self) {
        self.handle.terminate.set();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.handle.terminate.set();
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("watch_count", &self.settings.watches.len())
            .field("plugins", &self.registry.names())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// The state owned by the observer thread.
struct Core {
    handle: Arc<ObserverHandle>,
    cache: Arc<Cache>,
    registry: Arc<PluginRegistry>,
    discovery: Arc<dyn PluginDiscovery>,
    settings: Settings,
    config_path: Option<PathBuf>,
    plugin_dir: Option<PathBuf>,
    watches: HashMap<PathBuf, Watch>,
    config_watch: Option<Watch>,
    plugins_watch: Option<Watch>,
}

impl Core {
    fn run(mut self) {
        self.obey("watch_config");
        self.obey("watch_plugins");

        for (path, watch_settings) in self.settings.watches.clone() {
            let watch = self.make_watch(path.clone(), watch_settings);
            self.watches.insert(path, watch);
        }
        for watch in self.watches.values() {
            watch.start();
        }
        tracing::info!("observer running with {} watch(es)", self.watches.len());

        loop {
            self.handle.terminate.wait_timeout(TICK);
            if self.handle.terminate.is_set() {
                break;
            }
            if self.handle.error.is_set() {
                break;
            }
            if self.handle.plugins_changed.is_set() {
                self.handle.plugins_changed.clear();
                self.reload_plugins();
            }
            if self.handle.config_changed.is_set() {
                self.handle.config_changed.clear();
                self.refresh_settings();
            }
        }

        tracing::info!("observer stopping");
        for watch in self.watches.values() {
            watch.stop();
        }
        if let Some(watch) = &self.config_watch {
            watch.stop();
        }
        if let Some(watch) = &self.plugins_watch {
            watch.stop();
        }
        for watch in self.watches.values() {
            watch.join();
        }
        if let Some(watch) = &self.config_watch {
            watch.join();
        }
        if let Some(watch) = &self.plugins_watch {
            watch.join();
        }
    }

    fn make_watch(&self, path: PathBuf, settings: WatchSettings) -> Watch {
        Watch::kernel(
            self.handle.clone(),
            self.cache.clone(),
            self.registry.snapshot(),
            path,
            settings,
            default_source_factory(),
        )
    }

    /// Enact one global option against its current value.
    fn obey(&mut self, option: &str) {
        match option {
            "watch_config" => {
                if self.settings.global.watch_config.truthy() {
                    if let Some(path) = self.config_path.clone() {
                        let available = sentinel_set(&self.handle, Some(path.clone()), "config_watch");
                        let watch = Watch::poll(
                            self.handle.clone(),
                            self.cache.clone(),
                            available,
                            path,
                            WatchSettings::new().with("plugins", "config_watch"),
                        );
                        watch.start();
                        self.config_watch = Some(watch);
                    }
                } else if let Some(watch) = self.config_watch.take() {
                    tracing::info!("stopping config watch");
                    watch.stop();
                }
            }
            "watch_plugins" => {
                if self.settings.global.watch_plugins.truthy() {
                    match self.plugin_dir.clone() {
                        Some(dir) => {
                            let available =
                                sentinel_set(&self.handle, self.config_path.clone(), "plugins_watch");
                            let watch = Watch::kernel(
                                self.handle.clone(),
                                self.cache.clone(),
                                available,
                                dir,
                                WatchSettings::new().with("plugins", "plugins_watch"),
                                default_source_factory(),
                            );
                            watch.start();
                            self.plugins_watch = Some(watch);
                        }
                        None => {
                            tracing::warn!(
                                "watch_plugins is enabled but no plugin directory is configured"
                            );
                        }
                    }
                } else if let Some(watch) = self.plugins_watch.take() {
                    tracing::info!("stopping plugins watch");
                    watch.stop();
                }
            }
            other => {
                self.handle
                    .report(&Error::observer(format!("obey called with unknown option '{other}'")));
            }
        }
    }

    /// The plugin directory changed: re-scan the registry. New and updated
    /// factories reach each watch at its next reconfiguration cycle.
    fn reload_plugins(&mut self) {
        tracing::info!("plugin change detected, re-scanning registry");
        if let Err(err) = self.discovery.scan(&self.registry) {
            self.handle.report(&err);
        }
    }

    /// The configuration file changed: re-read it and reconcile the running
    /// watch set with the new declaration.
    fn refresh_settings(&mut self) {
        let Some(config_path) = self.config_path.clone() else {
            return;
        };
        tracing::info!("configuration changed, re-reading {}", config_path.display());

        let mut incoming = Settings::default();
        let loaded = RawSettings::from_file(&config_path).and_then(|raw| incoming.merge(raw));
        if let Err(err) = loaded {
            self.handle.report(&err);
            return;
        }
        let old = std::mem::replace(&mut self.settings, incoming);

        for (option, old_value) in old.global.options() {
            let new_value = match option {
                "watch_config" => &self.settings.global.watch_config,
                _ => &self.settings.global.watch_plugins,
            };
            if old_value.truthy() != new_value.truthy() {
                self.obey(option);
            }
        }

        // Watches removed from the configuration are stopped and dropped.
        let stale: Vec<PathBuf> = self
            .watches
            .keys()
            .filter(|path| !self.settings.watches.contains_key(*path))
            .cloned()
            .collect();
        for path in stale {
            if let Some(watch) = self.watches.remove(&path) {
                watch.stop();
            }
        }

        // Surviving watches get the new snapshot and settings published;
        // newly declared ones are constructed and started.
        let snapshot = self.registry.snapshot();
        for (path, watch_settings) in self.settings.watches.clone() {
            match self.watches.get(&path) {
                Some(watch) => watch.update_config(snapshot.clone(), watch_settings),
                None => {
                    let watch = self.make_watch(path.clone(), watch_settings);
                    watch.start();
                    self.watches.insert(path, watch);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Scalar;

    #[test]
    fn test_default_observer() {
        let observer = Observer::new().unwrap();
        assert_eq!(observer.settings().global.watch_config, Scalar::Bool(false));
        assert_eq!(observer.settings().global.watch_plugins, Scalar::Bool(false));
        assert!(observer.settings().watches.is_empty());
        assert!(observer.error().is_none());
        assert!(!observer.is_alive());
        // The built-in plugins are registered during construction.
        assert!(observer.registry().contains("mirror"));
        assert!(observer.registry().contains("scribe"));
    }

    #[test]
    fn test_inline_settings() {
        let observer =
            Observer::with_settings(RawSettings::new().global("watch_plugins", true)).unwrap();
        assert_eq!(observer.settings().global.watch_plugins, Scalar::Bool(true));
        assert_eq!(observer.settings().global.watch_config, Scalar::Bool(false));
    }

    #[test]
    fn test_invalid_inline_settings_fail_synchronously() {
        let err = Observer::with_settings(RawSettings::new().global("wacth_config", true))
            .unwrap_err();
        assert!(err.to_string().contains("illegal option"));
    }

    #[test]
    fn test_missing_config_file_fails_synchronously() {
        assert!(Observer::from_file("/nonexistent/vigil.toml").is_err());
    }

    #[test]
    fn test_sentinel_routing() {
        let handle = ObserverHandle::new();
        let mut sentinel = Sentinel {
            handle: handle.clone(),
            config_path: Some(PathBuf::from("/etc/vigil.toml")),
        };

        // Uninteresting kinds are ignored.
        sentinel
            .process_event(&Event::new(EventKind::Open, "/plugins").with_name("mod.so"))
            .unwrap();
        assert!(!handle.plugins_changed.is_set());

        // Hidden files and editor droppings are ignored.
        sentinel
            .process_event(&Event::new(EventKind::Create, "/plugins").with_name(".hidden"))
            .unwrap();
        sentinel
            .process_event(&Event::new(EventKind::Create, "/plugins").with_name("mod.rs.swp"))
            .unwrap();
        assert!(!handle.plugins_changed.is_set());

        // A real change in the plugin directory raises plugins-changed.
        sentinel
            .process_event(&Event::new(EventKind::Create, "/plugins").with_name("mod.so"))
            .unwrap();
        assert!(handle.plugins_changed.is_set());
        assert!(!handle.config_changed.is_set());

        // A change on the config path raises config-changed.
        sentinel
            .process_event(&Event::new(EventKind::Modify, "/etc/vigil.toml"))
            .unwrap();
        assert!(handle.config_changed.is_set());
    }

    #[test]
    fn test_report_severity() {
        let handle = ObserverHandle::new();
        handle.report(&Error::watch("/a", "gone"));
        assert!(handle.last_error().is_some());
        assert!(!handle.error.is_set());

        handle.report(&Error::plugin("/a", "scribe", "no log"));
        assert!(!handle.error.is_set());

        handle.report(&Error::observer("fatal"));
        assert!(handle.error.is_set());
        assert_eq!(handle.last_error().unwrap(), "observer error: fatal");
    }
}

//! Directory watches.
//!
//! A [`Watch`] owns one directory under observation: a dedicated event-loop
//! thread, its kernel-notification session, and the ordered list of plugins
//! events are dispatched to. A poll-mode watch implements the same contract
//! for single files that kernel notification cannot track reliably (editors
//! that rename on save), by watching the mtime instead.
//!
//! Cancellation and reconfiguration are cooperative: the observer publishes
//! data under the watch's lock, then sets a flag; the watch consults its
//! flags after every bounded wait (about once a second).

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::cache::Cache;
use crate::error::Error;
use crate::event::{Event, EventKind};
use crate::flag::Flag;
use crate::observer::ObserverHandle;
use crate::plugin::HostContext;
use crate::registry::PluginSet;
use crate::settings::WatchSettings;
use crate::source::SourceFactory;

/// Granularity of every bounded wait in watch and observer loops.
pub(crate) const TICK: Duration = Duration::from_secs(1);

enum Mode {
    Kernel(SourceFactory),
    Poll,
}

/// The validated dispatch pipeline of a watch.
struct Pipeline {
    available: PluginSet,
    settings: WatchSettings,
    /// Plugin names in configured order, de-duplicated, all present in
    /// `available` at validation time.
    order: Vec<String>,
}

struct State {
    pipeline: Pipeline,
    /// New (available_plugins, settings) published by the observer,
    /// consumed by the watch thread on its next loop iteration.
    pending: Option<(PluginSet, WatchSettings)>,
}

struct Inner {
    path: PathBuf,
    mode: Mode,
    observer: Arc<ObserverHandle>,
    cache: Arc<Cache>,
    terminate: Flag,
    error: Flag,
    config_changed: Flag,
    state: Mutex<State>,
}

impl Inner {
    fn validate(
        path: &Path,
        available: &PluginSet,
        settings: &WatchSettings,
    ) -> Result<Vec<String>, Error> {
        let Some(names) = settings.plugins() else {
            return Err(Error::watch(path, "missing 'plugins' option in configuration"));
        };
        let mut order = Vec::new();
        for name in names {
            if !available.contains_key(&name) {
                return Err(Error::watch(
                    path,
                    format!("required plugin '{name}' is missing"),
                ));
            }
            if !order.contains(&name) {
                order.push(name);
            }
        }
        Ok(order)
    }

    /// Validate and install a new pipeline. On a validation failure the
    /// previous pipeline is retained, the error flag is set and the error
    /// is reported; a watch in this state will not start (or will stop).
    fn configure(&self, available: PluginSet, settings: WatchSettings) {
        match Self::validate(&self.path, &available, &settings) {
            Ok(order) => {
                let mut state = self.state.lock();
                state.pipeline = Pipeline {
                    available,
                    settings,
                    order,
                };
            }
            Err(err) => {
                self.error.set();
                self.observer.report(&err);
            }
        }
    }

    /// Handle one event: self-stop checks, then plugin dispatch. Dropped
    /// entirely once the terminate or error flag is up.
    fn process_event(&self, event: &Event) {
        if self.error.is_set() || self.terminate.is_set() {
            return;
        }

        // Once the watched root itself is gone (deleted, or moved so that
        // every path we would report is stale), the watch winds itself down.
        // The triggering event is still dispatched below.
        if matches!(event.kind, EventKind::MoveSelf | EventKind::DeleteSelf)
            && event.is_on(&self.path)
        {
            self.terminate.set();
        }

        self.dispatch(event);
    }

    /// Dispatch to every configured plugin, serially, in order.
    fn dispatch(&self, event: &Event) {
        let (order, available, settings) = {
            let state = self.state.lock();
            (
                state.pipeline.order.clone(),
                state.pipeline.available.clone(),
                state.pipeline.settings.clone(),
            )
        };

        for name in &order {
            let Some(factory) = available.get(name) else {
                self.observer.report(&Error::watch(
                    &self.path,
                    format!("required plugin '{name}' is missing"),
                ));
                continue;
            };
            let host = HostContext {
                watch_path: self.path.clone(),
                cache: self.cache.clone(),
                config: settings.plugin_slice(name),
            };
            let mut plugin = factory.instantiate(host);
            match catch_unwind(AssertUnwindSafe(|| plugin.process_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    // A plugin error fails only this plugin for this event.
                    self.observer
                        .report(&Error::plugin(&self.path, name, err.to_string()));
                }
                Err(_) => {
                    self.error.set();
                    self.observer.report(&Error::watch(
                        &self.path,
                        format!("plugin '{name}' failed unexpectedly while processing {}", event.kind),
                    ));
                }
            }
        }
    }

    fn take_pending(&self) -> Option<(PluginSet, WatchSettings)> {
        self.state.lock().pending.take()
    }

    fn run_kernel(&self, factory: SourceFactory) {
        // Plugins may use this one to do any one-time initialisation.
        self.process_event(&Event::synthetic(EventKind::WatchInit, &self.path));

        let mut source = match factory(&self.path) {
            Ok(source) => source,
            Err(err) => {
                self.error.set();
                self.observer.report(&Error::watch(
                    &self.path,
                    format!("could not watch target: {err}. maybe it does not exist?"),
                ));
                return;
            }
        };
        tracing::info!("watch running on {}", self.path.display());

        loop {
            match source.read_events(TICK) {
                Ok(events) => {
                    for event in &events {
                        self.process_event(event);
                    }
                }
                Err(err) => {
                    self.error.set();
                    self.observer.report(&Error::watch(
                        &self.path,
                        format!("error while watching: {err}"),
                    ));
                    source.close();
                    return;
                }
            }

            if self.config_changed.is_set() {
                self.config_changed.clear();
                if let Some((available, settings)) = self.take_pending() {
                    self.configure(available, settings);
                    // Tell plugins their configuration might have changed.
                    self.process_event(&Event::synthetic(EventKind::WatchReconfig, &self.path));
                }
            }
            if self.error.is_set() {
                self.terminate.set();
            }
            if self.terminate.is_set() {
                self.terminate.clear();
                source.close();
                break;
            }
        }
        drop(source);

        // Final event, bypassing the flag check in process_event, so that
        // plugins can release anything they parked in the cache.
        self.dispatch(&Event::synthetic(EventKind::WatchDead, &self.path));
        tracing::info!("watch stopped on {}", self.path.display());
    }

    fn run_poll(&self) {
        fn mtime(path: &Path) -> io::Result<SystemTime> {
            std::fs::metadata(path)?.modified()
        }

        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.is_file() => {}
            _ => {
                self.error.set();
                self.observer.report(&Error::watch(
                    &self.path,
                    "missing target or target is not a regular file",
                ));
                return;
            }
        }
        let mut last = match mtime(&self.path) {
            Ok(stamp) => stamp,
            Err(err) => {
                self.error.set();
                self.observer
                    .report(&Error::watch(&self.path, format!("could not stat target: {err}")));
                return;
            }
        };
        tracing::info!("poll watch running on {}", self.path.display());

        loop {
            match mtime(&self.path) {
                Ok(stamp) => {
                    if stamp > last {
                        last = stamp;
                        self.process_event(&Event::new(EventKind::Modify, &self.path));
                    }
                }
                Err(err) => {
                    self.error.set();
                    self.observer
                        .report(&Error::watch(&self.path, format!("could not stat target: {err}")));
                    return;
                }
            }

            self.terminate.wait_timeout(TICK);
            if self.error.is_set() {
                self.terminate.set();
            }
            if self.terminate.is_set() {
                self.terminate.clear();
                break;
            }
        }
        tracing::info!("poll watch stopped on {}", self.path.display());
    }
}

/// A single path under observation, with its own thread, notification
/// session, and plugin pipeline.
///
/// Construction validates the configuration against the supplied plugin
/// snapshot; on failure the error is recorded on the owning observer and
/// [`start`](Watch::start) becomes a no-op. Watches are created through
/// [`Observer::attach_watch`](crate::Observer::attach_watch) and
/// [`Observer::attach_poll_watch`](crate::Observer::attach_poll_watch).
pub struct Watch {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watch {
    pub(crate) fn kernel(
        observer: Arc<ObserverHandle>,
        cache: Arc<Cache>,
        available: PluginSet,
        path: PathBuf,
        settings: WatchSettings,
        source_factory: SourceFactory,
    ) -> Self {
        Self::with_mode(
            observer,
            cache,
            available,
            path,
            settings,
            Mode::Kernel(source_factory),
        )
    }

    pub(crate) fn poll(
        observer: Arc<ObserverHandle>,
        cache: Arc<Cache>,
        available: PluginSet,
        path: PathBuf,
        settings: WatchSettings,
    ) -> Self {
        Self::with_mode(observer, cache, available, path, settings, Mode::Poll)
    }

    fn with_mode(
        observer: Arc<ObserverHandle>,
        cache: Arc<Cache>,
        available: PluginSet,
        path: PathBuf,
        settings: WatchSettings,
        mode: Mode,
    ) -> Self {
        let inner = Arc::new(Inner {
            path,
            mode,
            observer,
            cache,
            terminate: Flag::new(),
            error: Flag::new(),
            config_changed: Flag::new(),
            state: Mutex::new(State {
                pipeline: Pipeline {
                    available: PluginSet::new(),
                    settings: WatchSettings::new(),
                    order: Vec::new(),
                },
                pending: None,
            }),
        });
        inner.configure(available, settings);
        Self {
            inner,
            thread: Mutex::new(None),
        }
    }

    /// The watched path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Start the watch thread. A no-op when the watch is already in error,
    /// already stopping, or already started.
    pub fn start(&self) {
        if self.inner.error.is_set() || self.inner.terminate.is_set() {
            return;
        }
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name("vigil-watch".to_string())
            .spawn(move || match &inner.mode {
                Mode::Kernel(factory) => {
                    let factory = factory.clone();
                    inner.run_kernel(factory);
                }
                Mode::Poll => inner.run_poll(),
            });
        match spawned {
            Ok(handle) => *slot = Some(handle),
            Err(err) => {
                self.inner.error.set();
                self.inner.observer.report(&Error::watch(
                    &self.inner.path,
                    format!("could not start watch thread: {err}"),
                ));
            }
        }
    }

    /// Request the watch to stop. The thread exits within one tick.
    pub fn stop(&self) {
        self.inner.terminate.set();
    }

    /// Whether the watch thread is running.
    pub fn is_alive(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Whether the watch is in error state.
    pub fn has_error(&self) -> bool {
        self.inner.error.is_set()
    }

    /// Publish a new plugin snapshot and configuration to the watch. The
    /// watch revalidates and swaps them in on its next loop iteration, then
    /// dispatches a WATCH_RECONFIG event.
    pub fn update_config(&self, available: PluginSet, settings: WatchSettings) {
        {
            let mut state = self.inner.state.lock();
            state.pending = Some((available, settings));
        }
        self.inner.config_changed.set();
    }

    /// Wait for the watch thread to exit.
    pub(crate) fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("path", &self.inner.path)
            .field("alive", &self.is_alive())
            .field("error", &self.inner.error.is_set())
            .finish()
    }
}

//! # vigil
//!
//! Filesystem-event observer with per-directory plugin pipelines, a shared
//! TTL cache, and hot-reloadable configuration.
//!
//! This crate provides:
//! - **Watches** - one event-loop thread per watched directory, driving an
//!   inotify session with recursive auto-add
//! - **Plugin Dispatch** - every event delivered to an ordered, per-watch
//!   pipeline of plugins, with synthetic lifecycle events
//!   (`WATCH_INIT` / `WATCH_RECONFIG` / `WATCH_DEAD`)
//! - **Shared Cache** - a TTL key/value store plugins use to correlate
//!   paired events and memoize work across invocations
//! - **Self-Observation** - the observer watches its own configuration file
//!   and plugin directory and reconfigures itself in place
//! - **Error Notification** - failures in worker threads are carried back
//!   to the supervisor; it never dies silently
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vigil::{Observer, RawSettings, WatchSettings};
//!
//! let raw = RawSettings::new().watch(
//!     "/srv/data",
//!     WatchSettings::new()
//!         .with("plugins", vec!["mirror", "scribe"])
//!         .with("mirror_destination", "/srv/replica")
//!         .with("scribe_log", "/var/log/vigil.log"),
//! );
//! let mut observer = Observer::with_settings(raw)?;
//! observer.start()?;
//! // ...
//! observer.stop();
//! if let Some(message) = observer.error() {
//!     eprintln!("observer reported: {message}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod cache;
mod error;
mod event;
mod flag;
mod observer;
mod plugin;
pub mod plugins;
mod registry;
mod settings;
mod source;
mod watch;

pub use cache::{Cache, CacheValue};
pub use error::{Error, PluginError, Result};
pub use event::{Event, EventKind};
pub use flag::Flag;
pub use observer::{Observer, ObserverBuilder};
pub use plugin::{HostContext, Plugin, PluginConfig, PluginFactory};
pub use registry::{BuiltinPlugins, PluginDiscovery, PluginRegistry, PluginSet};
pub use settings::{Global, RawSettings, Scalar, Setting, Settings, WatchSettings};
pub use source::{default_source_factory, EventSource, SourceFactory};
pub use watch::Watch;

#[cfg(target_os = "linux")]
pub use source::InotifySource;

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Event-logging plugin.
//!
//! Appends one timestamped, human-readable line per event to the file named
//! by `scribe_log` (`-` logs to stdout). The open file handle lives in the
//! shared cache as a persistent entry so it survives between per-event
//! plugin instantiations, and is released on WATCH_DEAD. MOVED_FROM and
//! MOVED_TO halves of one rename are correlated by cookie through the cache
//! and reported as a matched move.

use std::fs;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::CacheValue;
use crate::error::PluginError;
use crate::event::{Event, EventKind};
use crate::plugin::{HostContext, Plugin};

/// Registry name of this plugin.
pub const NAME: &str = "scribe";

const LOG_KEY: &str = "scribe_log";

/// Logs every event on a watch.
pub struct Scribe {
    host: HostContext,
}

impl Scribe {
    /// Bind the plugin to one event delivery.
    pub fn new(host: HostContext) -> Self {
        Self { host }
    }

    fn describe(event: &Event) -> Option<String> {
        let what = if event.is_dir { "directory" } else { "file" };
        let name = event.display_name();
        let message = match event.kind {
            EventKind::Access => format!("{what} '{name}' was ACCESSED"),
            EventKind::Attrib => format!("the METADATA for {what} '{name}' was changed"),
            EventKind::CloseNowrite => {
                format!("{what} '{name}' was CLOSED without being written to")
            }
            EventKind::CloseWrite => format!("{what} '{name}' was CLOSED"),
            EventKind::Create => format!("{what} '{name}' was CREATED"),
            EventKind::Delete => format!("{what} '{name}' was DELETED"),
            EventKind::DeleteSelf => format!("watched {what} '{name}' was itself DELETED"),
            EventKind::Modify => format!("{what} '{name}' was MODIFIED"),
            EventKind::MoveSelf => format!("watched {what} '{name}' was itself MOVED"),
            EventKind::MovedFrom => format!("{what} '{name}' just MOVED OUT"),
            EventKind::MovedTo => format!("{what} '{name}' just MOVED IN"),
            EventKind::Open => format!("{what} '{name}' was OPENED"),
            EventKind::WatchInit | EventKind::WatchReconfig | EventKind::WatchDead => return None,
        };
        Some(message)
    }

    fn log(&self, message: &str) -> Result<(), PluginError> {
        let target = self.host.require_str(LOG_KEY)?;
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f");
        if target == "-" {
            println!("{stamp} {message}");
            return Ok(());
        }

        let key = format!("scribe_{target}");
        let file = match self.host.cache.get_as::<Mutex<fs::File>>(&key) {
            Some(file) => file,
            None => {
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(target)
                    .map_err(|err| {
                        PluginError::new(format!("could not open log file '{target}': {err}"))
                    })?;
                let file = Arc::new(Mutex::new(file));
                self.host.cache.push(key, file.clone() as CacheValue, true);
                file
            }
        };
        let mut file = file.lock();
        writeln!(file, "{stamp} {message}")
            .map_err(|err| PluginError::new(format!("could not write to log file '{target}': {err}")))
    }
}

impl Plugin for Scribe {
    fn process_event(&mut self, event: &Event) -> Result<(), PluginError> {
        match event.kind {
            EventKind::WatchInit => {
                return self.log(&format!("scribe: {}: WATCH STARTED", event.path.display()));
            }
            EventKind::WatchDead => {
                let result = self.log(&format!("scribe: {}: WATCH STOPPED", event.path.display()));
                // Drop the cached handle; a restarted watch reopens it.
                if let Some(target) = self.host.config_str(LOG_KEY) {
                    let key = format!("scribe_{target}");
                    self.host.cache.pop(&key);
                }
                return result;
            }
            EventKind::WatchReconfig => return Ok(()),
            _ => {}
        }

        let Some(message) = Self::describe(event) else {
            return Ok(());
        };
        self.log(&format!("scribe: {}: {message}", event.path.display()))?;

        if matches!(event.kind, EventKind::MovedFrom | EventKind::MovedTo) {
            let key = format!("scribe_{}", event.cookie);
            if let Some(parked) = self.host.cache.pop_as::<Event>(&key) {
                let (moved_from, moved_to): (&Event, &Event) =
                    if event.kind == EventKind::MovedFrom {
                        (event, parked.as_ref())
                    } else {
                        (parked.as_ref(), event)
                    };
                let what = if event.is_dir { "directory" } else { "file" };
                self.log(&format!(
                    "scribe: MOVE events matched: {what} '{}' was moved to '{}'",
                    moved_from.full_path().display(),
                    moved_to.full_path().display()
                ))?;
            } else {
                // First half of the pair; wait for the twin.
                self.host.cache.push(key, Arc::new(event.clone()), false);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::plugin::PluginConfig;
    use crate::settings::Setting;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        log: PathBuf,
        cache: Arc<Cache>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("scribe.log");
            Self {
                dir,
                log,
                cache: Arc::new(Cache::new(Duration::from_secs(10), 100)),
            }
        }

        fn watch_path(&self) -> &Path {
            self.dir.path()
        }

        fn deliver(&self, event: &Event) -> Result<(), PluginError> {
            let mut config = PluginConfig::new();
            config.insert(
                LOG_KEY.to_string(),
                Setting::from(self.log.to_string_lossy().into_owned()),
            );
            Scribe::new(HostContext {
                watch_path: self.watch_path().to_path_buf(),
                cache: self.cache.clone(),
                config,
            })
            .process_event(event)
        }

        fn lines(&self) -> Vec<String> {
            fs::read_to_string(&self.log)
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn test_missing_log_directive_is_plugin_error() {
        let fixture = Fixture::new();
        let mut plugin = Scribe::new(HostContext {
            watch_path: fixture.watch_path().to_path_buf(),
            cache: fixture.cache.clone(),
            config: PluginConfig::new(),
        });
        let err = plugin
            .process_event(&Event::synthetic(EventKind::WatchInit, fixture.watch_path()))
            .unwrap_err();
        assert_eq!(err.to_string(), "missing scribe_log directive");
    }

    #[test]
    fn test_lifecycle_token_order() {
        let fixture = Fixture::new();
        let root = fixture.watch_path().to_path_buf();

        fixture
            .deliver(&Event::synthetic(EventKind::WatchInit, &root))
            .unwrap();
        fixture
            .deliver(&Event::new(EventKind::Create, &root).with_name("foo"))
            .unwrap();
        fixture
            .deliver(&Event::new(EventKind::Open, &root).with_name("foo"))
            .unwrap();
        fixture
            .deliver(&Event::new(EventKind::Attrib, &root).with_name("foo"))
            .unwrap();
        fixture
            .deliver(&Event::new(EventKind::CloseWrite, &root).with_name("foo"))
            .unwrap();
        fixture
            .deliver(&Event::synthetic(EventKind::WatchDead, &root))
            .unwrap();

        let lines = fixture.lines();
        let order = ["STARTED", "CREATED", "OPENED", "METADATA", "CLOSED", "STOPPED"];
        assert_eq!(lines.len(), order.len());
        for (line, token) in lines.iter().zip(order) {
            assert!(line.contains(token), "{line:?} should contain {token:?}");
        }
    }

    #[test]
    fn test_file_handle_is_cached_and_released() {
        let fixture = Fixture::new();
        let root = fixture.watch_path().to_path_buf();
        let key = format!("scribe_{}", fixture.log.display());

        fixture
            .deliver(&Event::synthetic(EventKind::WatchInit, &root))
            .unwrap();
        assert!(fixture.cache.get(&key).is_some());

        fixture
            .deliver(&Event::synthetic(EventKind::WatchDead, &root))
            .unwrap();
        assert!(fixture.cache.get(&key).is_none());
    }

    #[test]
    fn test_matched_move_is_reported() {
        let fixture = Fixture::new();
        let root = fixture.watch_path().to_path_buf();

        fixture
            .deliver(
                &Event::new(EventKind::MovedFrom, &root)
                    .with_name("bar")
                    .with_cookie(99),
            )
            .unwrap();
        fixture
            .deliver(
                &Event::new(EventKind::MovedTo, root.join("blade"))
                    .with_name("bar")
                    .with_cookie(99),
            )
            .unwrap();

        let lines = fixture.lines();
        assert!(lines.iter().any(|l| l.contains("MOVED OUT")));
        assert!(lines.iter().any(|l| l.contains("MOVED IN")));
        let matched = lines
            .iter()
            .find(|l| l.contains("MOVE events matched"))
            .unwrap();
        assert!(matched.contains("blade"));

        // The parked half was consumed.
        assert!(fixture.cache.get("scribe_99").is_none());
    }

    #[test]
    fn test_unmatched_cookies_stay_parked() {
        let fixture = Fixture::new();
        let root = fixture.watch_path().to_path_buf();

        fixture
            .deliver(
                &Event::new(EventKind::MovedFrom, &root)
                    .with_name("a")
                    .with_cookie(1),
            )
            .unwrap();
        fixture
            .deliver(
                &Event::new(EventKind::MovedTo, &root)
                    .with_name("b")
                    .with_cookie(2),
            )
            .unwrap();

        assert!(!fixture.lines().iter().any(|l| l.contains("matched")));
        assert!(fixture.cache.get("scribe_1").is_some());
        assert!(fixture.cache.get("scribe_2").is_some());
    }

    #[test]
    fn test_stdout_target() {
        let fixture = Fixture::new();
        let mut config = PluginConfig::new();
        config.insert(LOG_KEY.to_string(), Setting::from("-"));
        let mut plugin = Scribe::new(HostContext {
            watch_path: fixture.watch_path().to_path_buf(),
            cache: fixture.cache.clone(),
            config,
        });
        plugin
            .process_event(&Event::synthetic(EventKind::WatchInit, fixture.watch_path()))
            .unwrap();
        assert!(!fixture.log.exists());
    }
}

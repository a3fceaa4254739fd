//! Error types for observer and watch operations.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running the observer.
///
/// Errors raised before the observer thread starts propagate to the caller;
/// afterwards they are recorded on the observer and readable via
/// [`Observer::error`](crate::Observer::error).
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration value or structure.
    #[error("configuration error: {0}")]
    Config(String),

    /// The configuration file could not be read or parsed.
    #[error("error reading configuration file: {0}")]
    ConfigFile(String),

    /// The plugin registry could not be (re)scanned.
    #[error("could not load plugin(s): {0}")]
    PluginLoad(String),

    /// A watch failed: missing plugin, dead target, kernel registration.
    #[error("watch {}: {message}", path.display())]
    Watch {
        /// The watched path.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// A plugin reported an error while processing one event.
    #[error("watch {}: plugin '{plugin}' reported error: {message}", path.display())]
    Plugin {
        /// The watch the plugin ran under.
        path: PathBuf,
        /// Name of the failing plugin.
        plugin: String,
        /// The plugin's error message.
        message: String,
    },

    /// General observer failure.
    #[error("observer error: {0}")]
    Observer(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a watch error for the given path.
    pub fn watch(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Watch {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a plugin error bound to a watch and plugin name.
    pub fn plugin(path: impl Into<PathBuf>, plugin: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Plugin {
            path: path.into(),
            plugin: plugin.into(),
            message: msg.into(),
        }
    }

    /// Create an observer error.
    pub fn observer(msg: impl Into<String>) -> Self {
        Self::Observer(msg.into())
    }

    /// Returns true if this error must stop the whole observer.
    ///
    /// Watch-level errors stop only their watch; plugin errors stop nothing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::ConfigFile(_) | Self::PluginLoad(_) | Self::Observer(_)
        )
    }

    /// Returns true if this error came out of a plugin.
    pub fn is_plugin(&self) -> bool {
        matches!(self, Self::Plugin { .. })
    }
}

/// Error raised by a plugin from [`process_event`](crate::Plugin::process_event).
///
/// Plugin errors are caught by the owning watch, converted into an
/// [`Error::Plugin`] carrying the plugin name, and never interrupt dispatch
/// to the remaining plugins.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct PluginError(pub String);

impl PluginError {
    /// Create a plugin error from a message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Create a plugin error describing a failed operation on a path.
    pub fn on_path(action: &str, path: &Path, err: impl std::fmt::Display) -> Self {
        Self(format!("error {} '{}': {}", action, path.display(), err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::watch("/srv/data", "required plugin 'scribe' is missing");
        assert_eq!(
            err.to_string(),
            "watch /srv/data: required plugin 'scribe' is missing"
        );

        let err = Error::plugin("/srv/data", "mirror", "missing mirror_destination directive");
        assert!(err.to_string().contains("mirror"));
        assert!(err.to_string().contains("/srv/data"));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::config("bad option").is_fatal());
        assert!(Error::observer("boom").is_fatal());
        assert!(!Error::watch("/a", "gone").is_fatal());
        assert!(!Error::plugin("/a", "scribe", "no log").is_fatal());
        assert!(Error::plugin("/a", "scribe", "no log").is_plugin());
    }
}

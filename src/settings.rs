//! Observer configuration.
//!
//! The configuration is a mapping of mappings with two top-level sections,
//! rendered as TOML:
//!
//! ```toml
//! [global]
//! watch_config = true
//! watch_plugins = "yes"
//!
//! [watches."/srv/data"]
//! plugins = ["mirror", "scribe"]
//! mirror_destination = "/srv/replica"
//! scribe_log = "/var/log/vigil.log"
//! ```
//!
//! `global` admits exactly `watch_config` and `watch_plugins`, both scalar.
//! Every per-watch table must carry `plugins` (a name or a list of names);
//! any key of the form `<plugin>_<option>` is handed to the plugin of that
//! name as its configuration slice.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// A scalar-or-list configuration value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Setting {
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A string.
    Str(String),
    /// A list of strings.
    List(Vec<String>),
}

impl Setting {
    /// The string payload, if this setting is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The setting as a list of names: a string becomes a one-element list.
    pub fn as_list(&self) -> Option<Vec<String>> {
        match self {
            Self::Str(s) => Some(vec![s.clone()]),
            Self::List(items) => Some(items.clone()),
            _ => None,
        }
    }

    /// The setting as a scalar, if it is not a list.
    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Self::Bool(b) => Some(Scalar::Bool(*b)),
            Self::Int(i) => Some(Scalar::Int(*i)),
            Self::Str(s) => Some(Scalar::Str(s.clone())),
            Self::List(_) => None,
        }
    }
}

impl From<bool> for Setting {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Setting {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Setting {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Setting {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<String>> for Setting {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<Vec<&str>> for Setting {
    fn from(value: Vec<&str>) -> Self {
        Self::List(value.into_iter().map(str::to_string).collect())
    }
}

/// A scalar global option value. The raw value is preserved as configured;
/// [`truthy`](Scalar::truthy) applies the conversion at the point of use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar {
    /// A boolean.
    Bool(bool),
    /// An integer; truthy when nonzero.
    Int(i64),
    /// A string; truthy when `"1"`, `"yes"` or `"true"` (case-insensitive).
    Str(String),
}

impl Scalar {
    /// Truthiness of the raw value.
    pub fn truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Str(s) => {
                s == "1" || s.eq_ignore_ascii_case("yes") || s.eq_ignore_ascii_case("true")
            }
        }
    }
}

/// The validated `global` section.
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    /// Whether the observer watches its own configuration file.
    pub watch_config: Scalar,
    /// Whether the observer watches its plugin directory.
    pub watch_plugins: Scalar,
}

impl Default for Global {
    fn default() -> Self {
        Self {
            watch_config: Scalar::Bool(false),
            watch_plugins: Scalar::Bool(false),
        }
    }
}

impl Global {
    /// The recognised option names and their current values.
    pub fn options(&self) -> [(&'static str, &Scalar); 2] {
        [
            ("watch_config", &self.watch_config),
            ("watch_plugins", &self.watch_plugins),
        ]
    }
}

/// The options of one watched directory.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WatchSettings {
    options: BTreeMap<String, Setting>,
}

impl WatchSettings {
    /// Create an empty option map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an option, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Setting>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Look up an option.
    pub fn get(&self, key: &str) -> Option<&Setting> {
        self.options.get(key)
    }

    /// The configured plugin names; `None` when the `plugins` key is missing
    /// or malformed. A single string is accepted in place of a list.
    pub fn plugins(&self) -> Option<Vec<String>> {
        self.options.get("plugins").and_then(Setting::as_list)
    }

    /// The configuration slice for `plugin`: every option whose key starts
    /// with `<plugin>_`. The `plugins` key itself is never included.
    pub fn plugin_slice(&self, plugin: &str) -> BTreeMap<String, Setting> {
        let prefix = format!("{plugin}_");
        self.options
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Whether no options are set.
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

impl From<BTreeMap<String, Setting>> for WatchSettings {
    fn from(options: BTreeMap<String, Setting>) -> Self {
        Self { options }
    }
}

/// An unvalidated configuration mapping, as deserialized from a file or
/// supplied inline at observer construction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSettings {
    /// The `global` section; keys are validated during merge.
    #[serde(default)]
    pub global: BTreeMap<String, Setting>,
    /// The `watches` section; present (possibly empty) means "replace".
    #[serde(default)]
    pub watches: Option<BTreeMap<String, BTreeMap<String, Setting>>>,
}

impl RawSettings {
    /// Create an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a global option, builder style.
    pub fn global(mut self, key: impl Into<String>, value: impl Into<Setting>) -> Self {
        self.global.insert(key.into(), value.into());
        self
    }

    /// Add a watch, builder style.
    pub fn watch(mut self, path: impl Into<String>, settings: WatchSettings) -> Self {
        self.watches
            .get_or_insert_with(BTreeMap::new)
            .insert(path.into(), settings.options);
        self
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::ConfigFile(e.to_string()))
    }

    /// Read and parse a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::ConfigFile(e.to_string()))?;
        Self::from_toml(&text)
    }
}

/// The merged, validated observer configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    /// Global options.
    pub global: Global,
    /// Watched directories, keyed by canonical absolute path.
    pub watches: BTreeMap<PathBuf, WatchSettings>,
}

impl Settings {
    /// Merge a raw mapping onto these settings: global options overwrite
    /// per key, a present `watches` section replaces the watch set wholesale.
    /// Watch paths are canonicalised to absolute real paths.
    pub fn merge(&mut self, raw: RawSettings) -> Result<()> {
        for (key, value) in raw.global {
            let scalar = value.as_scalar().ok_or_else(|| {
                Error::config(format!("illegal value for option '{key}' in configuration"))
            })?;
            match key.as_str() {
                "watch_config" => self.global.watch_config = scalar,
                "watch_plugins" => self.global.watch_plugins = scalar,
                _ => {
                    return Err(Error::config(format!(
                        "illegal option '{key}' in configuration"
                    )))
                }
            }
        }
        if let Some(watches) = raw.watches {
            self.watches = watches
                .into_iter()
                .map(|(path, options)| (canonical(Path::new(&path)), WatchSettings::from(options)))
                .collect();
        }
        Ok(())
    }

    /// Defaults merged with one raw mapping.
    pub fn from_raw(raw: RawSettings) -> Result<Self> {
        let mut settings = Self::default();
        settings.merge(raw)?;
        Ok(settings)
    }
}

/// Resolve a path to an absolute real path. Falls back to a lexical
/// normalisation when the path does not exist.
pub(crate) fn canonical(path: &Path) -> PathBuf {
    if let Ok(real) = path.canonicalize() {
        return real;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut normalised = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalised.pop();
            }
            other => normalised.push(other),
        }
    }
    normalised
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.global.watch_config, Scalar::Bool(false));
        assert_eq!(settings.global.watch_plugins, Scalar::Bool(false));
        assert!(settings.watches.is_empty());
    }

    #[test]
    fn test_truthiness() {
        assert!(Scalar::Bool(true).truthy());
        assert!(!Scalar::Bool(false).truthy());
        assert!(Scalar::Int(2).truthy());
        assert!(!Scalar::Int(0).truthy());
        assert!(Scalar::Str("1".into()).truthy());
        assert!(Scalar::Str("Yes".into()).truthy());
        assert!(Scalar::Str("TRUE".into()).truthy());
        assert!(!Scalar::Str("0".into()).truthy());
        assert!(!Scalar::Str("on".into()).truthy());
    }

    #[test]
    fn test_merge_overwrites_per_key() {
        let mut settings = Settings::default();
        settings
            .merge(RawSettings::new().global("watch_plugins", true))
            .unwrap();
        assert_eq!(settings.global.watch_plugins, Scalar::Bool(true));
        assert_eq!(settings.global.watch_config, Scalar::Bool(false));
    }

    #[test]
    fn test_merge_rejects_unknown_global() {
        let err = Settings::from_raw(RawSettings::new().global("watch_cofnig", true)).unwrap_err();
        assert!(err.to_string().contains("illegal option"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_merge_rejects_list_global() {
        let raw = RawSettings::new().global("watch_config", vec!["1"]);
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn test_merge_replaces_watches() {
        let mut settings = Settings::default();
        settings
            .merge(RawSettings::new().watch("/a", WatchSettings::new().with("plugins", "scribe")))
            .unwrap();
        assert_eq!(settings.watches.len(), 1);
        settings
            .merge(RawSettings::new().watch("/b", WatchSettings::new().with("plugins", "mirror")))
            .unwrap();
        assert_eq!(settings.watches.len(), 1);
        assert!(settings.watches.contains_key(&PathBuf::from("/b")));
    }

    #[test]
    fn test_plugins_string_or_list() {
        let single = WatchSettings::new().with("plugins", "scribe");
        assert_eq!(single.plugins().unwrap(), vec!["scribe".to_string()]);

        let many = WatchSettings::new().with("plugins", vec!["mirror", "scribe"]);
        assert_eq!(many.plugins().unwrap().len(), 2);

        let missing = WatchSettings::new().with("pluginss", "scribe");
        assert!(missing.plugins().is_none());
    }

    #[test]
    fn test_plugin_slice() {
        let settings = WatchSettings::new()
            .with("plugins", vec!["mirror", "scribe"])
            .with("mirror_destination", "/srv/replica")
            .with("scribe_log", "-")
            .with("scribe_verbose", true);

        let slice = settings.plugin_slice("scribe");
        assert_eq!(slice.len(), 2);
        assert_eq!(slice.get("scribe_log").unwrap().as_str(), Some("-"));
        assert!(!slice.contains_key("plugins"));
        assert!(!slice.contains_key("mirror_destination"));

        assert!(settings.plugin_slice("unknown").is_empty());
    }

    #[test]
    fn test_toml_round() {
        let raw = RawSettings::from_toml(
            r#"
            [global]
            watch_config = "1"

            [watches."/srv/data"]
            plugins = ["mirror", "scribe"]
            mirror_destination = "/srv/replica"

            [watches."/srv/other"]
            "#,
        )
        .unwrap();
        let settings = Settings::from_raw(raw).unwrap();
        assert_eq!(settings.global.watch_config, Scalar::Str("1".into()));
        assert_eq!(settings.watches.len(), 2);
        let data = settings.watches.get(&PathBuf::from("/srv/data")).unwrap();
        assert_eq!(data.plugins().unwrap().len(), 2);
        let other = settings.watches.get(&PathBuf::from("/srv/other")).unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_toml_rejects_garbage() {
        assert!(RawSettings::from_toml("not [ valid").is_err());
    }

    #[test]
    fn test_canonical_lexical_fallback() {
        assert_eq!(
            canonical(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }
}

//! Filesystem event model.
//!
//! Events are either decoded from the kernel notification source or
//! synthesised by the supervisor (the `WATCH_*` lifecycle kinds). Plugins
//! receive both through the same channel and distinguish them by kind.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// The kind of a filesystem event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A file was read.
    Access,
    /// Metadata (permissions, timestamps, ownership) changed.
    Attrib,
    /// A file opened read-only was closed.
    CloseNowrite,
    /// A file opened for writing was closed.
    CloseWrite,
    /// A file or directory was created.
    Create,
    /// A file or directory was deleted.
    Delete,
    /// The watched item itself was deleted.
    DeleteSelf,
    /// File contents changed.
    Modify,
    /// The watched item itself was moved.
    MoveSelf,
    /// A file or directory was moved out; paired with [`MovedTo`](Self::MovedTo) by cookie.
    MovedFrom,
    /// A file or directory was moved in; paired with [`MovedFrom`](Self::MovedFrom) by cookie.
    MovedTo,
    /// A file was opened.
    Open,
    /// First event on a watch, before any kernel event.
    WatchInit,
    /// Emitted after the watch successfully swapped in a new configuration.
    WatchReconfig,
    /// Last event on a watch, after its loop has exited.
    WatchDead,
}

impl EventKind {
    /// Whether this kind is synthesised by the supervisor rather than the kernel.
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Self::WatchInit | Self::WatchReconfig | Self::WatchDead)
    }

    /// The wire-format name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "ACCESS",
            Self::Attrib => "ATTRIB",
            Self::CloseNowrite => "CLOSE_NOWRITE",
            Self::CloseWrite => "CLOSE_WRITE",
            Self::Create => "CREATE",
            Self::Delete => "DELETE",
            Self::DeleteSelf => "DELETE_SELF",
            Self::Modify => "MODIFY",
            Self::MoveSelf => "MOVE_SELF",
            Self::MovedFrom => "MOVED_FROM",
            Self::MovedTo => "MOVED_TO",
            Self::Open => "OPEN",
            Self::WatchInit => "WATCH_INIT",
            Self::WatchReconfig => "WATCH_RECONFIG",
            Self::WatchDead => "WATCH_DEAD",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single filesystem event.
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Absolute directory the event pertains to. For self-events and
    /// synthetic events this is the watched path itself.
    pub path: PathBuf,
    /// Leaf name within `path`; absent for self-events and synthetic events.
    pub name: Option<OsString>,
    /// Whether the affected item is a directory.
    pub is_dir: bool,
    /// Rename correlation token shared by the MOVED_FROM/MOVED_TO pair of
    /// one rename. Zero when the event is not part of a rename.
    pub cookie: u32,
}

impl Event {
    /// Create a kernel-style event on a directory.
    pub fn new(kind: EventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            name: None,
            is_dir: false,
            cookie: 0,
        }
    }

    /// Create a synthetic lifecycle event on a watched path.
    pub fn synthetic(kind: EventKind, path: impl Into<PathBuf>) -> Self {
        debug_assert!(kind.is_synthetic());
        Self::new(kind, path)
    }

    /// Set the leaf name.
    pub fn with_name(mut self, name: impl Into<OsString>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the rename cookie.
    pub fn with_cookie(mut self, cookie: u32) -> Self {
        self.cookie = cookie;
        self
    }

    /// Mark the event as concerning a directory.
    pub fn dir(mut self, is_dir: bool) -> Self {
        self.is_dir = is_dir;
        self
    }

    /// The full path of the affected item: `path/name`, or `path` for
    /// self-events and synthetic events.
    pub fn full_path(&self) -> PathBuf {
        match &self.name {
            Some(name) => self.path.join(name),
            None => self.path.clone(),
        }
    }

    /// The leaf name rendered for display; `.` when absent.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.to_string_lossy().into_owned(),
            None => ".".to_string(),
        }
    }

    /// Whether `self` and `other` are the two halves of one rename.
    pub fn pairs_with(&self, other: &Event) -> bool {
        self.cookie != 0
            && self.cookie == other.cookie
            && matches!(
                (self.kind, other.kind),
                (EventKind::MovedFrom, EventKind::MovedTo)
                    | (EventKind::MovedTo, EventKind::MovedFrom)
            )
    }

    /// Whether the event concerns the given watched root itself.
    pub fn is_on(&self, root: &Path) -> bool {
        self.name.is_none() && self.path == root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(EventKind::CloseWrite.as_str(), "CLOSE_WRITE");
        assert_eq!(EventKind::WatchInit.as_str(), "WATCH_INIT");
        assert!(EventKind::WatchDead.is_synthetic());
        assert!(!EventKind::DeleteSelf.is_synthetic());
    }

    #[test]
    fn test_full_path() {
        let event = Event::new(EventKind::Create, "/srv/data").with_name("foo");
        assert_eq!(event.full_path(), PathBuf::from("/srv/data/foo"));

        let event = Event::synthetic(EventKind::WatchInit, "/srv/data");
        assert_eq!(event.full_path(), PathBuf::from("/srv/data"));
        assert_eq!(event.display_name(), ".");
    }

    #[test]
    fn test_cookie_pairing() {
        let from = Event::new(EventKind::MovedFrom, "/srv").with_name("a").with_cookie(7);
        let to = Event::new(EventKind::MovedTo, "/srv").with_name("b").with_cookie(7);
        let other = Event::new(EventKind::MovedTo, "/srv").with_name("c").with_cookie(8);

        assert!(from.pairs_with(&to));
        assert!(to.pairs_with(&from));
        assert!(!from.pairs_with(&other));

        // Cookie zero never pairs.
        let a = Event::new(EventKind::MovedFrom, "/srv").with_name("a");
        let b = Event::new(EventKind::MovedTo, "/srv").with_name("b");
        assert!(!a.pairs_with(&b));
    }
}

//! Kernel notification sources.
//!
//! A watch drives an [`EventSource`]: an abstract producer of typed
//! [`Event`]s with a bounded wait, so the watch loop can observe its control
//! flags about once a second regardless of filesystem activity. The
//! production source on Linux is an inotify session; tests inject scripted
//! sources through the same seam.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::event::Event;

/// An abstract producer of filesystem events rooted at one directory.
pub trait EventSource: Send {
    /// Return any events already queued, or wait up to `timeout` for new
    /// ones. An empty vector means the timeout elapsed quietly.
    fn read_events(&mut self, timeout: Duration) -> io::Result<Vec<Event>>;

    /// Release the session. The kernel side is also released on drop.
    fn close(&mut self) {}
}

/// Opens an [`EventSource`] for a watch root. Watches hold one of these so
/// the session can be opened on the watch thread.
pub type SourceFactory = Arc<dyn Fn(&Path) -> io::Result<Box<dyn EventSource>> + Send + Sync>;

/// The platform default source factory.
pub fn default_source_factory() -> SourceFactory {
    Arc::new(|root: &Path| -> io::Result<Box<dyn EventSource>> {
        #[cfg(target_os = "linux")]
        {
            Ok(Box::new(InotifySource::open(root)?))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = root;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no kernel notification backend on this platform",
            ))
        }
    })
}

#[cfg(target_os = "linux")]
pub use self::inotify_source::InotifySource;

#[cfg(target_os = "linux")]
mod inotify_source {
    use std::collections::HashMap;
    use std::ffi::OsString;
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};

    use crate::event::{Event, EventKind};

    use super::EventSource;

    /// An inotify session covering a directory tree.
    ///
    /// Every directory under the root is registered for all inode event
    /// kinds; directories created (or moved in) later are added as they
    /// appear. Events carry the absolute path of the directory they were
    /// observed in, the leaf name where the kernel supplies one, and the
    /// rename cookie for MOVED_FROM/MOVED_TO pairs.
    pub struct InotifySource {
        inotify: Inotify,
        watches: HashMap<WatchDescriptor, PathBuf>,
        buffer: [u8; 4096],
    }

    impl InotifySource {
        /// Open a session rooted at `root`. Fails if any subdirectory
        /// cannot be registered.
        pub fn open(root: &Path) -> io::Result<Self> {
            let inotify = Inotify::init()?;
            let mut source = Self {
                inotify,
                watches: HashMap::new(),
                buffer: [0; 4096],
            };
            source.add_tree(root)?;
            tracing::debug!(
                "inotify session open on {} ({} directories)",
                root.display(),
                source.watches.len()
            );
            Ok(source)
        }

        /// Number of directories currently registered.
        pub fn watch_count(&self) -> usize {
            self.watches.len()
        }

        fn add_tree(&mut self, dir: &Path) -> io::Result<()> {
            let wd = self.inotify.watches().add(dir, WatchMask::ALL_EVENTS)?;
            self.watches.insert(wd, dir.to_path_buf());
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    self.add_tree(&entry.path())?;
                }
            }
            Ok(())
        }

        fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
            let mut pollfd = libc::pollfd {
                fd: self.inotify.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
            // SAFETY: pollfd points at one valid struct for the duration of the call.
            let ret = unsafe { libc::poll(&mut pollfd, 1, millis) };
            match ret {
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        Ok(false)
                    } else {
                        Err(err)
                    }
                }
                0 => Ok(false),
                _ => Ok(true),
            }
        }

        /// Decode everything currently queued, without blocking.
        fn drain(&mut self) -> io::Result<Vec<Event>> {
            type Raw = (WatchDescriptor, EventMask, u32, Option<OsString>);
            let mut raw: Vec<Raw> = Vec::new();
            loop {
                match self.inotify.read_events(&mut self.buffer) {
                    Ok(events) => {
                        let before = raw.len();
                        for event in events {
                            raw.push((
                                event.wd.clone(),
                                event.mask,
                                event.cookie,
                                event.name.map(|n| n.to_os_string()),
                            ));
                        }
                        if raw.len() == before {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => return Err(err),
                }
            }

            let mut out = Vec::new();
            for (wd, mask, cookie, name) in raw {
                if mask.contains(EventMask::Q_OVERFLOW) {
                    tracing::warn!("inotify queue overflow, events were lost");
                    continue;
                }
                if mask.contains(EventMask::IGNORED) {
                    self.watches.remove(&wd);
                    continue;
                }
                let Some(base) = self.watches.get(&wd).cloned() else {
                    continue;
                };
                let Some(kind) = kind_of(mask) else {
                    continue;
                };
                let mut event = Event::new(kind, base).dir(mask.contains(EventMask::ISDIR));
                event.cookie = cookie;
                event.name = name;

                // A directory appearing under the tree is registered before
                // the event is delivered, so nothing inside it is missed.
                if event.is_dir && matches!(kind, EventKind::Create | EventKind::MovedTo) {
                    let path = event.full_path();
                    if let Err(err) = self.add_tree(&path) {
                        tracing::warn!(
                            "could not watch new directory {}: {}",
                            path.display(),
                            err
                        );
                    }
                }
                out.push(event);
            }
            Ok(out)
        }
    }

    impl EventSource for InotifySource {
        fn read_events(&mut self, timeout: Duration) -> io::Result<Vec<Event>> {
            let events = self.drain()?;
            if !events.is_empty() {
                return Ok(events);
            }
            if self.wait_readable(timeout)? {
                self.drain()
            } else {
                Ok(Vec::new())
            }
        }

        fn close(&mut self) {
            self.watches.clear();
        }
    }

    impl std::fmt::Debug for InotifySource {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("InotifySource")
                .field("watches", &self.watches.len())
                .finish()
        }
    }

    fn kind_of(mask: EventMask) -> Option<EventKind> {
        if mask.contains(EventMask::ACCESS) {
            Some(EventKind::Access)
        } else if mask.contains(EventMask::ATTRIB) {
            Some(EventKind::Attrib)
        } else if mask.contains(EventMask::CLOSE_NOWRITE) {
            Some(EventKind::CloseNowrite)
        } else if mask.contains(EventMask::CLOSE_WRITE) {
            Some(EventKind::CloseWrite)
        } else if mask.contains(EventMask::CREATE) {
            Some(EventKind::Create)
        } else if mask.contains(EventMask::DELETE) {
            Some(EventKind::Delete)
        } else if mask.contains(EventMask::DELETE_SELF) {
            Some(EventKind::DeleteSelf)
        } else if mask.contains(EventMask::MODIFY) {
            Some(EventKind::Modify)
        } else if mask.contains(EventMask::MOVE_SELF) {
            Some(EventKind::MoveSelf)
        } else if mask.contains(EventMask::MOVED_FROM) {
            Some(EventKind::MovedFrom)
        } else if mask.contains(EventMask::MOVED_TO) {
            Some(EventKind::MovedTo)
        } else if mask.contains(EventMask::OPEN) {
            Some(EventKind::Open)
        } else {
            None
        }
    }
}

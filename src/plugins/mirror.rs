//! Directory-mirroring plugin.
//!
//! Maintains a replica of the watched tree under `mirror_destination`. The
//! first event on a watch triggers a full resync; afterwards each kernel
//! event is applied incrementally. A rename inside the tree arrives as a
//! MOVED_FROM/MOVED_TO pair sharing a cookie: the first half is parked in
//! the shared cache and resolved by the next handled event: its twin turns
//! into a rename inside the replica, anything else means the object left
//! the tree and its replica copy is deleted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::PluginError;
use crate::event::{Event, EventKind};
use crate::plugin::{HostContext, Plugin};

/// Registry name of this plugin.
pub const NAME: &str = "mirror";

const DESTINATION_KEY: &str = "mirror_destination";

enum Action {
    Copy,
    CopyStat,
    Delete,
    Park,
    Resync,
    None,
}

/// Mirrors the watched directory to a replica location.
pub struct Mirror {
    host: HostContext,
}

impl Mirror {
    /// Bind the plugin to one event delivery.
    pub fn new(host: HostContext) -> Self {
        Self { host }
    }

    fn destination(&self) -> Result<PathBuf, PluginError> {
        self.host.require_str(DESTINATION_KEY).map(PathBuf::from)
    }

    fn config_key(&self) -> String {
        format!("mirror_config_{}", self.host.watch_path.display())
    }

    fn pending_key(&self) -> String {
        format!("mirror_{}", self.host.watch_path.display())
    }

    /// The replica path of an item inside the watched tree.
    fn mirror_path(&self, source: &Path, destination: &Path) -> PathBuf {
        match source.strip_prefix(&self.host.watch_path) {
            Ok(relative) => destination.join(relative),
            Err(_) => destination.to_path_buf(),
        }
    }

    /// Delete the replica and rebuild it from the watched tree.
    fn resync(&self, destination: &Path) -> Result<(), PluginError> {
        remove_target(destination)
            .map_err(|err| PluginError::on_path("deleting", destination, err))?;
        copy_tree(&self.host.watch_path, destination)
            .map_err(|err| PluginError::new(format!("error creating initial mirror: {err}")))
    }

    fn copy(&self, event: &Event, destination: &Path) {
        let source = event.full_path();
        let target = self.mirror_path(&source, destination);
        let result = if event.is_dir {
            // Directories are created fresh, with the source's permissions.
            fs::create_dir(&target).and_then(|_| copy_stat(&source, &target))
        } else {
            fs::copy(&source, &target).map(|_| ())
        };
        if let Err(err) = result {
            // The source is usually gone again already; the replica will
            // catch the delete event that follows.
            tracing::debug!("mirror: skipping copy of {}: {}", source.display(), err);
        }
    }

    fn copy_metadata(&self, event: &Event, destination: &Path) {
        let source = event.full_path();
        let target = self.mirror_path(&source, destination);
        if let Err(err) = copy_stat(&source, &target) {
            tracing::debug!("mirror: skipping metadata of {}: {}", source.display(), err);
        }
    }

    fn delete(&self, source: &Path, destination: &Path) -> Result<(), PluginError> {
        let target = self.mirror_path(source, destination);
        remove_target(&target).map_err(|err| PluginError::on_path("deleting", &target, err))
    }

    fn finish_move(
        &self,
        from: &Event,
        to: &Event,
        destination: &Path,
    ) -> Result<(), PluginError> {
        let source = self.mirror_path(&from.full_path(), destination);
        let target = self.mirror_path(&to.full_path(), destination);
        fs::rename(&source, &target).map_err(|err| {
            PluginError::new(format!(
                "error moving '{}' to '{}': {err}",
                source.display(),
                target.display()
            ))
        })
    }
}

impl Plugin for Mirror {
    fn process_event(&mut self, event: &Event) -> Result<(), PluginError> {
        let destination = self.destination()?;

        match event.kind {
            EventKind::WatchInit => {
                self.host
                    .cache
                    .push(self.config_key(), Arc::new(destination.clone()), true);
            }
            EventKind::WatchReconfig => {
                let cached = self.host.cache.get_as::<PathBuf>(&self.config_key());
                if cached.as_deref() != Some(&destination) {
                    // The replica target moved: remember it and rebuild.
                    self.host
                        .cache
                        .push(self.config_key(), Arc::new(destination.clone()), true);
                    self.resync(&destination)?;
                }
            }
            EventKind::WatchDead => {
                self.host.cache.pop(&self.config_key());
            }
            _ => {}
        }

        let action = match event.kind {
            EventKind::Attrib => Action::CopyStat,
            EventKind::Create | EventKind::Modify | EventKind::MovedTo => Action::Copy,
            EventKind::Delete => Action::Delete,
            EventKind::MovedFrom => Action::Park,
            EventKind::WatchInit => Action::Resync,
            EventKind::WatchReconfig | EventKind::WatchDead => Action::None,
            // Kinds the mirror does not act on skip the pending-move
            // protocol as well.
            _ => return Ok(()),
        };

        if let Some(parked) = self.host.cache.pop_as::<Event>(&self.pending_key()) {
            if event.kind == EventKind::MovedTo && event.pairs_with(&parked) {
                return self.finish_move(&parked, event, &destination);
            }
            // The parked object was moved out of the tree for good.
            self.delete(&parked.full_path(), &destination)?;
        }

        match action {
            Action::Copy => self.copy(event, &destination),
            Action::CopyStat => self.copy_metadata(event, &destination),
            Action::Delete => self.delete(&event.full_path(), &destination)?,
            Action::Park => {
                self.host
                    .cache
                    .push(self.pending_key(), Arc::new(event.clone()), false);
            }
            Action::Resync => self.resync(&destination)?,
            Action::None => {}
        }
        Ok(())
    }
}

fn remove_target(target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target),
        Ok(_) => fs::remove_file(target),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn copy_stat(source: &Path, target: &Path) -> io::Result<()> {
    let permissions = fs::metadata(source)?.permissions();
    fs::set_permissions(target, permissions)
}

fn copy_tree(source: &Path, target: &Path) -> io::Result<()> {
    fs::create_dir_all(target)?;
    copy_stat(source, target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

//! Built-in plugins.

pub mod mirror;
pub mod scribe;

pub use mirror::Mirror;
pub use scribe::Scribe;

use std::sync::Arc;

use crate::plugin::{HostContext, Plugin};
use crate::registry::PluginRegistry;

/// Register the built-in plugins under their canonical names.
pub fn register_builtin(registry: &PluginRegistry) {
    registry.register(
        mirror::NAME,
        Arc::new(|host: HostContext| Box::new(Mirror::new(host)) as Box<dyn Plugin>),
    );
    registry.register(
        scribe::NAME,
        Arc::new(|host: HostContext| Box::new(Scribe::new(host)) as Box<dyn Plugin>),
    );
}

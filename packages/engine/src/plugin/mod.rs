mod matching;
mod runtime;
mod types;

pub use runtime::{NoopPluginHost, PluginHost, PluginInstance, PluginRegistry};
pub use types::{
    InstalledPlugin, PluginEntityChange, PluginEntityState, PluginFileDescriptor, PluginManifest,
};

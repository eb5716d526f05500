//! Typed addresses for the things a template can reference
//!
//! All address types are immutable value types compared by structural
//! equality. They identify input variables, local values, data sources and
//! plugins independently of where in the source text they were written.
mod plugin;
mod reference;

pub use plugin::{
    is_plugin_part_normalized, parse_plugin_part, parse_plugin_source_string, Plugin,
    PluginPartError, PluginSourceError, DEFAULT_PLUGIN_HOST, DEFAULT_PLUGIN_NAMESPACE,
};
pub use reference::{
    parse_ref, InstanceKey, Reference, Referenceable, Resource, ResourceInstance, ResourceMode,
};

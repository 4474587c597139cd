//! Declarative configuration model and loader.

mod loader;
mod types;

pub use types::*;

pub(crate) use loader::yaml_from_str;

//! Registry of externally provided operator kinds.

use std::collections::BTreeSet;

pub const PREPROCESS: &str = "Preprocess";

/// Names of the custom kinds available to this compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginRegistry {
    names: BTreeSet<String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>) -> Self {
        self.register(name);
        self
    }

    /// Returns `false` when the kind was already registered.
    pub fn register(&mut self, name: impl Into<String>) -> bool {
        self.names.insert(name.into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Registry from `GRAFT_PLUGINS`, a comma-separated list of kind names.
    pub fn from_env() -> Self {
        std::env::var("GRAFT_PLUGINS")
            .map(|value| value.split(',').map(str::trim).filter(|n| !n.is_empty()).map(String::from).collect())
            .unwrap_or_default()
    }
}

impl<S: Into<String>> FromIterator<S> for PluginRegistry {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self { names: iter.into_iter().map(Into::into).collect() }
    }
}

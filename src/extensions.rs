//! Extension registry: name → filter-factory lookup and plugin loading.
//!
//! The registry is an opaque name→function table; the mixer knows nothing
//! about it and extension filters enter the pipeline through the same
//! chain-splicing API as the built-in stages. Loading is abstracted behind
//! [`PluginLoader`], so the registration/lookup logic stays independent of
//! any dynamic-library mechanism.

use crate::error::{ResonaError, Result};
use crate::filter::TimeFilter;
use std::collections::HashMap;
use std::path::Path;

/// Creates a fresh stage instance each time the filter is installed.
pub type FilterFactory = Box<dyn Fn() -> Box<dyn TimeFilter> + Send + Sync>;

/// Name-keyed table of extension filter factories.
pub struct ExtensionRegistry {
    filters: HashMap<String, FilterFactory>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    /// Registers a filter factory under `name`.
    ///
    /// # Errors
    ///
    /// Invalid-operation if the name is already taken.
    pub fn register_filter(&mut self, name: &str, factory: FilterFactory) -> Result<()> {
        if self.filters.contains_key(name) {
            return Err(ResonaError::invalid_operation(format!(
                "extension filter {:?} is already registered",
                name
            )));
        }
        log::info!("registered extension filter {:?}", name);
        self.filters.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.keys().map(String::as_str).collect()
    }

    /// Instantiates the named filter.
    ///
    /// # Errors
    ///
    /// Invalid-enum if no factory is registered under `name`.
    pub fn instantiate(&self, name: &str) -> Result<Box<dyn TimeFilter>> {
        let factory = self.filters.get(name).ok_or_else(|| {
            ResonaError::invalid_enum(format!("no extension filter named {:?}", name))
        })?;
        Ok(factory())
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability for bringing extension filters into a registry.
///
/// Platform-specific dynamic loading lives behind this trait; the registry
/// itself never touches a loading mechanism.
pub trait PluginLoader: Send + Sync {
    /// Loads the plugin at `path` and registers whatever it provides.
    fn load(&self, path: &Path, registry: &mut ExtensionRegistry) -> Result<()>;
}

/// Loader for filters compiled into the host application: carries a fixed
/// set of factories and registers them all, ignoring the path.
pub struct StaticLoader {
    entries: Vec<(String, fn() -> Box<dyn TimeFilter>)>,
}

impl StaticLoader {
    pub fn new(entries: Vec<(String, fn() -> Box<dyn TimeFilter>)>) -> Self {
        Self { entries }
    }
}

impl PluginLoader for StaticLoader {
    fn load(&self, _path: &Path, registry: &mut ExtensionRegistry) -> Result<()> {
        for (name, factory) in &self.entries {
            let factory = *factory;
            registry.register_filter(name, Box::new(move || factory()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{MixParams, StageCtx};

    struct Muffle;
    impl TimeFilter for Muffle {
        fn name(&self) -> &str {
            "muffle"
        }
        fn apply(&self, _: &StageCtx<'_>, out: &mut MixParams) {
            out.gain *= 0.5;
        }
    }

    #[test]
    fn registration_and_lookup_round_trip() {
        let mut registry = ExtensionRegistry::new();
        registry
            .register_filter("muffle", Box::new(|| Box::new(Muffle)))
            .unwrap();

        assert!(registry.contains("muffle"));
        let stage = registry.instantiate("muffle").unwrap();
        assert_eq!(stage.name(), "muffle");
    }

    #[test]
    fn duplicate_names_and_unknown_lookups_fail() {
        let mut registry = ExtensionRegistry::new();
        registry
            .register_filter("muffle", Box::new(|| Box::new(Muffle)))
            .unwrap();

        let err = registry
            .register_filter("muffle", Box::new(|| Box::new(Muffle)))
            .unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::InvalidOperation));

        let err = registry.instantiate("reverb").unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::InvalidEnum));
    }

    #[test]
    fn static_loader_registers_its_entries() {
        fn make_muffle() -> Box<dyn TimeFilter> {
            Box::new(Muffle)
        }

        let loader = StaticLoader::new(vec![("muffle".to_string(), make_muffle)]);
        let mut registry = ExtensionRegistry::new();
        loader.load(Path::new("builtin"), &mut registry).unwrap();
        assert!(registry.contains("muffle"));
    }
}

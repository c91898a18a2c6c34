//! Plugin class registry and the set of loaded plugin instances.

use crate::error::{PluginError, PluginResult};
use crate::plugin::{FrameProcessorPlugin, PluginRunner};
use crate::plugins::{
    DummyPlugin, LiveViewPlugin, OffsetAdjustmentPlugin, ParameterAdjustmentPlugin,
    PercivalProcessPlugin, RawFileWriterPlugin, SumPlugin,
};
use odin_pool::PoolRegistry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared resources handed to plugin factories.
#[derive(Debug, Clone, Default)]
pub struct PluginEnv {
    /// Pools for frames built by plugins
    pub pools: Arc<PoolRegistry>,
}

/// Builds a plugin instance.
pub type PluginFactory = fn(&PluginEnv) -> Box<dyn FrameProcessorPlugin>;

/// Class name to factory map plus the instances loaded from it.
pub struct PluginRegistry {
    env: PluginEnv,
    factories: BTreeMap<String, PluginFactory>,
    loaded: Vec<Arc<PluginRunner>>,
}

impl PluginRegistry {
    /// Registry without any plugin classes.
    #[must_use]
    pub fn new(env: PluginEnv) -> Self {
        Self {
            env,
            factories: BTreeMap::new(),
            loaded: Vec::new(),
        }
    }

    /// Registry with every plugin shipped in this crate.
    #[must_use]
    pub fn with_builtins(env: PluginEnv) -> Self {
        let mut registry = Self::new(env);
        registry.register(DummyPlugin::NAME, |_| Box::new(DummyPlugin::default()));
        registry.register(SumPlugin::NAME, |_| Box::new(SumPlugin::default()));
        registry.register(OffsetAdjustmentPlugin::NAME, |_| {
            Box::new(OffsetAdjustmentPlugin::default())
        });
        registry.register(ParameterAdjustmentPlugin::NAME, |_| {
            Box::new(ParameterAdjustmentPlugin::default())
        });
        registry.register(LiveViewPlugin::NAME, |_| Box::new(LiveViewPlugin::default()));
        registry.register(RawFileWriterPlugin::NAME, |_| {
            Box::new(RawFileWriterPlugin::default())
        });
        registry.register(PercivalProcessPlugin::NAME, |env| {
            Box::new(PercivalProcessPlugin::new(Arc::clone(&env.pools)))
        });
        registry
    }

    /// Register `factory` as `class_name`, replacing any previous entry.
    pub fn register(&mut self, class_name: &str, factory: PluginFactory) {
        self.factories.insert(class_name.to_string(), factory);
    }

    /// Registered class names, sorted.
    #[must_use]
    pub fn classes(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Shared plugin resources.
    #[must_use]
    pub fn env(&self) -> &PluginEnv {
        &self.env
    }

    /// Build `class_name` as the stage `index` and start its worker.
    ///
    /// Loading an index that already exists returns the loaded instance.
    pub fn load(&mut self, class_name: &str, index: &str) -> PluginResult<Arc<PluginRunner>> {
        if let Some(existing) = self.get(index) {
            if existing.class_name() == class_name {
                info!(index, class = class_name, "Plugin already loaded");
            } else {
                warn!(
                    index,
                    requested = class_name,
                    loaded = existing.class_name(),
                    "Index already loaded with another class"
                );
            }
            return Ok(existing);
        }

        let factory = self
            .factories
            .get(class_name)
            .ok_or_else(|| PluginError::UnknownClass(class_name.to_string()))?;
        let runner = PluginRunner::new(index, class_name, factory(&self.env));
        runner.start()?;
        info!(index, class = class_name, "Plugin loaded");
        self.loaded.push(Arc::clone(&runner));
        Ok(runner)
    }

    /// Loaded instance `index`.
    #[must_use]
    pub fn get(&self, index: &str) -> Option<Arc<PluginRunner>> {
        self.loaded.iter().find(|p| p.name() == index).cloned()
    }

    /// Loaded instances in load order.
    #[must_use]
    pub fn loaded(&self) -> &[Arc<PluginRunner>] {
        &self.loaded
    }

    /// Indexes of loaded instances in load order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.loaded.iter().map(|p| p.name().to_string()).collect()
    }

    /// Stop every loaded instance in load order. Instances stay listed.
    pub fn stop_all(&self) {
        for plugin in &self.loaded {
            plugin.stop();
        }
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("classes", &self.classes())
            .field("loaded", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_builtins() {
        let registry = PluginRegistry::with_builtins(PluginEnv::default());
        let classes = registry.classes();
        for class in ["DummyPlugin", "SumPlugin", "LiveViewPlugin", "RawFileWriterPlugin"] {
            assert!(classes.contains(&class.to_string()), "missing {class}");
        }
    }

    #[test]
    #[traced_test]
    fn test_duplicate_load_returns_loaded_instance() {
        let mut registry = PluginRegistry::with_builtins(PluginEnv::default());
        let first = registry.load("DummyPlugin", "dummy").unwrap();
        let second = registry.load("DummyPlugin", "dummy").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.names(), vec!["dummy".to_string()]);
        assert!(logs_contain("Plugin already loaded"));
        registry.stop_all();
    }

    #[test]
    fn test_unknown_class() {
        let mut registry = PluginRegistry::with_builtins(PluginEnv::default());
        assert!(matches!(
            registry.load("Hdf5Plugin", "hdf"),
            Err(PluginError::UnknownClass(name)) if name == "Hdf5Plugin"
        ));
        assert!(registry.loaded().is_empty());
    }
}

use std::sync::Arc;
use tracing::{debug, warn};
use crate::config::Config;
use crate::display::DisplayRef;
use crate::dsa::DynamicSleep;
use crate::handle::OpenHandles;
use crate::persist::DsaStore;
use crate::registry::Registry;
use crate::retry::RetryStats;
use crate::sleep::SleepPolicy;
use crate::Error;

/// Everything shared by the handles of one application.
///
/// Cloning is cheap; clones share the same registry and open-handle set.
#[derive(Clone)]
pub struct Context {
    config: Arc<Config>,
    registry: Arc<Registry>,
    stats: Arc<dyn RetryStats>,
    sleep: Arc<dyn SleepPolicy>,
    dynamic: Option<Arc<DynamicSleep>>,
    open: Arc<OpenHandles>,
    store: Option<Arc<dyn DsaStore>>,
}

impl Context {
    /// Builds a registry and adaptive sleep policy from `config`.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        Ok(Context::build(config))
    }

    fn build(config: Config) -> Self {
        let registry = Arc::new(Registry::new(config.registry_defaults()));
        let dynamic = Arc::new(DynamicSleep::new(registry.clone(), config.dsa_options()));

        Context {
            config: Arc::new(config),
            stats: registry.clone(),
            registry: registry,
            sleep: dynamic.clone(),
            dynamic: Some(dynamic),
            open: Default::default(),
            store: None,
        }
    }

    /// Assembles a context from its parts.
    ///
    /// Without a [`DynamicSleep`] policy there is no adjustment state to
    /// persist, so no store is consulted.
    pub fn from_parts(config: Config, registry: Arc<Registry>, stats: Arc<dyn RetryStats>, sleep: Arc<dyn SleepPolicy>) -> Self {
        Context {
            config: Arc::new(config),
            registry: registry,
            stats: stats,
            sleep: sleep,
            dynamic: None,
            open: Default::default(),
            store: None,
        }
    }

    /// Persists sleep adjustments in `store`.
    pub fn with_store(mut self, store: Arc<dyn DsaStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Per-display state.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Retry ceilings and outcome recording.
    pub fn stats(&self) -> &dyn RetryStats {
        &*self.stats
    }

    /// Delay policy.
    pub fn sleep(&self) -> &dyn SleepPolicy {
        &*self.sleep
    }

    /// The adaptive policy, when the context owns one.
    pub fn dynamic_sleep(&self) -> Option<&Arc<DynamicSleep>> {
        self.dynamic.as_ref()
    }

    /// Paths with an open handle.
    pub fn open_handles(&self) -> &OpenHandles {
        &self.open
    }

    /// The persistence store, if any.
    pub fn store(&self) -> Option<&Arc<dyn DsaStore>> {
        self.store.as_ref()
    }

    /// Loads the persisted sleep adjustment of `dref`, if there is one.
    ///
    /// Returns whether anything was restored. Store errors are logged.
    pub fn restore_sleep(&self, dref: &DisplayRef) -> bool {
        let (dynamic, store) = match (&self.dynamic, &self.store) {
            (Some(dynamic), Some(store)) => (dynamic, store),
            _ => return false,
        };

        match store.restore(&dref.persistence_key()) {
            Ok(Some(snapshot)) => {
                dynamic.restore(dref.path(), &snapshot);
                true
            },
            Ok(None) => false,
            Err(e) => {
                warn!(display = %dref.path(), error = %e, "failed to restore sleep adjustment");
                false
            },
        }
    }

    /// Saves the sleep adjustment of `dref`.
    ///
    /// Store errors are logged.
    pub fn save_sleep(&self, dref: &DisplayRef) {
        let (dynamic, store) = match (&self.dynamic, &self.store) {
            (Some(dynamic), Some(store)) => (dynamic, store),
            _ => return,
        };

        let snapshot = dynamic.snapshot(dref.path());
        match store.save(&dref.persistence_key(), &snapshot) {
            Ok(()) => debug!(display = %dref.path(), factor = snapshot.adjustment_factor, "saved sleep adjustment"),
            Err(e) => warn!(display = %dref.path(), error = %e, "failed to save sleep adjustment"),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::build(Config::default())
    }
}

impl ::std::fmt::Debug for Context {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("open", &self.open)
            .field("dynamic", &self.dynamic.is_some())
            .field("store", &self.store.is_some())
            .finish()
    }
}

//! Runtime wiring for the worker process.
//!
//! Storage and cache are in-memory stand-ins; the scheduler only sees the
//! `Storage` / `CacheInvalidation` traits, so real adapters slot in here.

use std::sync::Arc;

use tracing::info;

use taskforge_infra::cache::{CacheInvalidation, InMemoryCache};
use taskforge_infra::config::SchedulerConfig;
use taskforge_infra::jobs::{
    HandlerRegistry, Jobs, RetentionSweeper, Scheduler, SchedulerStats, SweeperHandle,
    TriggerDriver, TriggerError, TriggerHandle, default_rules, register_default_handlers,
};
use taskforge_infra::storage::{InMemoryStorage, Storage};

/// Running background services.
pub struct Services {
    pub scheduler: Scheduler,
    pub jobs: Jobs,
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<dyn CacheInvalidation>,
    sweeper: SweeperHandle,
    triggers: Option<TriggerHandle>,
}

impl Services {
    /// Build the scheduler and spawn its timers on the current runtime.
    pub fn start(config: SchedulerConfig) -> Result<Self, TriggerError> {
        let storage: Arc<dyn Storage> = InMemoryStorage::arc();
        let cache: Arc<dyn CacheInvalidation> = InMemoryCache::arc();
        Self::start_with(config, storage, cache)
    }

    pub fn start_with(
        config: SchedulerConfig,
        storage: Arc<dyn Storage>,
        cache: Arc<dyn CacheInvalidation>,
    ) -> Result<Self, TriggerError> {
        let mut registry = HandlerRegistry::new();
        register_default_handlers(&mut registry, storage.clone(), cache.clone());

        let triggers_enabled = config.triggers_enabled;
        let sweeper = RetentionSweeper::from_config(&config);
        let scheduler = Scheduler::new(config, registry);

        // Parse rules before spawning anything so a bad rule leaves no tasks behind.
        let rules = if triggers_enabled {
            Some(default_rules()?)
        } else {
            None
        };

        let sweeper = sweeper.spawn(scheduler.clone());
        let triggers = rules.map(|rules| {
            let count = rules.len();
            let handle = TriggerDriver::spawn(rules, scheduler.clone(), storage.clone());
            info!(rules = count, "trigger rules started");
            handle
        });

        info!(
            max_jobs = scheduler.config().max_jobs,
            handlers = ?scheduler.registry().registered_types(),
            triggers = triggers.is_some(),
            "background services started"
        );

        Ok(Self {
            jobs: Jobs::new(scheduler.clone()),
            scheduler,
            storage,
            cache,
            sweeper,
            triggers,
        })
    }

    /// Stop triggers, then the sweeper, then the scheduler; returns final stats.
    pub async fn shutdown(self) -> SchedulerStats {
        if let Some(triggers) = self.triggers {
            triggers.shutdown().await;
        }
        self.sweeper.shutdown().await;

        self.scheduler.shutdown();
        self.scheduler.wait_idle().await;
        self.scheduler.stats()
    }
}

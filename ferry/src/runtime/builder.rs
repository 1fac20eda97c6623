use std::fmt;
use std::sync::Arc;

use crate::admission::{AdmissionControl, OperationPoolResolver, PoolResolver};
use crate::config::FerryConfig;
use crate::events::EventBus;
use crate::persistence::InMemoryJobStore;
use crate::store::JobStore;
use crate::substrate::{self, ExecutionSubstrate};

use super::dispatcher::Dispatcher;
use super::orchestrator::JobOrchestrator;

/// Builder for constructing a [`Dispatcher`] with explicit dependencies.
///
/// The store is required. The substrate defaults to the one selected by
/// `config.substrate`, the event bus to a fresh bus sized by
/// `config.events`, and the pool resolver to one pool per operation kind.
///
/// # Example
///
/// ```ignore
/// use ferry::*;
///
/// let dispatcher = DispatcherBuilder::new(FerryConfig::load("ferry.toml")?)
///     .with_store(Arc::new(InMemoryJobStore::new()))
///     .with_pool_resolver(Arc::new(MyResolver))
///     .build()?;
/// ```
pub struct DispatcherBuilder {
    config: FerryConfig,
    store: Option<Arc<dyn JobStore>>,
    substrate: Option<Arc<dyn ExecutionSubstrate>>,
    events: Option<Arc<EventBus>>,
    resolver: Option<Arc<dyn PoolResolver>>,
}

impl fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("DispatcherBuilder");
        debug.field("config", &self.config);
        debug.field("store_set", &self.store.is_some());
        debug.field("substrate_set", &self.substrate.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.field("resolver_set", &self.resolver.is_some());

        if let Some(substrate) = &self.substrate {
            debug.field("substrate_name", &substrate.name());
        }

        debug.finish()
    }
}

impl DispatcherBuilder {
    pub fn new(config: FerryConfig) -> Self {
        Self {
            config,
            store: None,
            substrate: None,
            events: None,
            resolver: None,
        }
    }

    pub fn config(&self) -> &FerryConfig {
        &self.config
    }

    /// Set the job store.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a fresh in-memory store. Nothing survives the process.
    pub fn with_memory_store(self) -> Self {
        self.with_store(Arc::new(InMemoryJobStore::new()))
    }

    /// Connect to PostgreSQL using `config.persistence` and apply the schema.
    #[cfg(feature = "postgres")]
    pub async fn with_postgres_store(self) -> anyhow::Result<Self> {
        let store = crate::persistence::PostgresJobStore::connect(&self.config.persistence).await?;
        store.migrate().await?;
        Ok(self.with_store(Arc::new(store)))
    }

    /// Set the execution substrate.
    pub fn with_substrate(mut self, substrate: Arc<dyn ExecutionSubstrate>) -> Self {
        self.substrate = Some(substrate);
        self
    }

    /// Share an existing event bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set how jobs map to resource pools.
    pub fn with_pool_resolver(mut self, resolver: Arc<dyn PoolResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Build the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if no store was provided.
    pub fn build(self) -> anyhow::Result<Dispatcher> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let substrate = self
            .substrate
            .unwrap_or_else(|| substrate::from_config(&self.config.substrate));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(EventBus::new(self.config.events.capacity)));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(OperationPoolResolver));

        tracing::debug!(
            substrate = substrate.name(),
            default_pool_limit = self.config.pools.default_limit,
            "building dispatcher"
        );

        let store_retry = self.config.supervisor.store_retry;
        let orchestrator = JobOrchestrator::new(
            Arc::clone(&store),
            substrate,
            Arc::clone(&events),
            self.config.supervisor,
            self.config.retry,
        );

        Ok(Dispatcher::new(
            store,
            orchestrator,
            AdmissionControl::new(self.config.pools),
            resolver,
            events,
            store_retry,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_a_store() {
        let err = DispatcherBuilder::new(FerryConfig::default())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("store dependency missing"));
    }

    #[tokio::test]
    async fn builds_with_defaults() {
        let events = Arc::new(EventBus::new(8));
        let dispatcher = DispatcherBuilder::new(FerryConfig::default())
            .with_memory_store()
            .with_events(Arc::clone(&events))
            .build()
            .unwrap();

        let _rx = dispatcher.subscribe();
        assert_eq!(events.subscriber_count(), 1);
        assert_eq!(dispatcher.pool_utilization("sync").limit, 4);
    }
}

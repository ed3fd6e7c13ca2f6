//! Registry factory: one registry per live connection, evicted when idle

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use vmhub_core::{FilterSet, ViewModelTypes};

use crate::registry::{PushCallback, ViewModelRegistry};

/// Sweep period bounds
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Factory configuration
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// A registry untouched for this long is evicted
    pub idle_timeout: Duration,
    /// How often the background sweep runs
    pub sweep_interval: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(20 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl FactoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Creates the registry for a new connection id
pub type RegistryBuilder = Arc<dyn Fn(&str) -> Arc<ViewModelRegistry> + Send + Sync>;

struct RegistryEntry {
    registry: Arc<ViewModelRegistry>,
    last_access: Mutex<Instant>,
}

impl RegistryEntry {
    fn new(registry: Arc<ViewModelRegistry>) -> Self {
        Self {
            registry,
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn idle_time(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_time() >= timeout
    }
}

/// Owns every connection's registry.
///
/// Any lookup through the factory counts as activity for that connection.
pub struct RegistryFactory {
    config: FactoryConfig,
    registries: DashMap<String, RegistryEntry>,
    builder: RegistryBuilder,
}

impl std::fmt::Debug for RegistryFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryFactory")
            .field("config", &self.config)
            .field("registries", &self.registries.len())
            .finish()
    }
}

impl RegistryFactory {
    pub fn new(config: FactoryConfig, builder: RegistryBuilder) -> Self {
        Self {
            config,
            registries: DashMap::new(),
            builder,
        }
    }

    /// Factory whose registries share `types`, `filters` and `push`
    pub fn with_types(
        config: FactoryConfig,
        types: ViewModelTypes,
        filters: FilterSet,
        push: PushCallback,
    ) -> Self {
        let builder: RegistryBuilder = Arc::new(move |connection_id: &str| {
            ViewModelRegistry::new(
                connection_id,
                types.clone(),
                filters.clone(),
                Arc::clone(&push),
            )
        });
        Self::new(config, builder)
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Registry for `connection_id`, created on first use
    pub fn get_or_create(&self, connection_id: &str) -> Arc<ViewModelRegistry> {
        let entry = self
            .registries
            .entry(connection_id.to_string())
            .or_insert_with(|| {
                debug!(connection_id, "Creating registry");
                RegistryEntry::new((self.builder)(connection_id))
            });
        entry.touch();
        Arc::clone(&entry.registry)
    }

    /// Registry for `connection_id` if it is live; never creates one
    pub fn get(&self, connection_id: &str) -> Option<Arc<ViewModelRegistry>> {
        self.registries.get(connection_id).map(|entry| {
            entry.touch();
            Arc::clone(&entry.registry)
        })
    }

    /// Liveness check that does not count as activity
    pub fn is_live(&self, connection_id: &str) -> bool {
        self.registries.contains_key(connection_id)
    }

    /// Time since the connection's registry was last used
    pub fn idle_time(&self, connection_id: &str) -> Option<Duration> {
        self.registries
            .get(connection_id)
            .map(|entry| entry.idle_time())
    }

    /// Drop a connection's registry and dispose its view models.
    ///
    /// Returns false when there was nothing to remove.
    pub async fn remove(&self, connection_id: &str) -> bool {
        let Some((_, entry)) = self.registries.remove(connection_id) else {
            return false;
        };
        let disposed = entry.registry.dispose_all().await;
        debug!(connection_id, disposed, "Removed registry");
        true
    }

    /// Evict every registry idle for at least the configured timeout
    pub async fn sweep(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let expired: Vec<String> = self
            .registries
            .iter()
            .filter(|entry| entry.value().is_expired(timeout))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for connection_id in expired {
            // re-checked under the shard lock: a touch may have raced the scan
            let removed = self
                .registries
                .remove_if(&connection_id, |_, entry| entry.is_expired(timeout));
            if let Some((_, entry)) = removed {
                entry.registry.dispose_all().await;
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted, remaining = self.registries.len(), "Evicted idle registries");
        }
        evicted
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the handle
    /// is dropped or the factory goes away
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweepHandle {
        let factory = Arc::downgrade(self);
        let period = self
            .config
            .sweep_interval
            .clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);
        let task = tokio::spawn(run_sweeper(factory, period));
        SweepHandle { task }
    }

    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.registries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registries.is_empty()
    }
}

async fn run_sweeper(factory: Weak<RegistryFactory>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(factory) = factory.upgrade() else {
            break;
        };
        factory.sweep().await;
    }
}

/// Background sweep task; aborted when dropped
#[derive(Debug)]
pub struct SweepHandle {
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

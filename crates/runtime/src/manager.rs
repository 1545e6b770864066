//! Multi-slot model lifecycle: bounded per-class pools, LRU eviction and
//! per-model single-flight loading.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use lemonade_catalog::{Catalog, ModelClass, ModelDescriptor, RecipeOptions};
use lemonade_common::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{info, warn};

use crate::SharedBackend;

/// Constructs a backend for a descriptor; injected so tests can substitute
/// the subprocess-backed implementation.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(
        &self,
        descriptor: &ModelDescriptor,
        options: &RecipeOptions,
    ) -> Result<SharedBackend>;
}

/// Pool capacities and request-level option overrides
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_llm_models: usize,
    pub max_embedding_models: usize,
    pub max_reranking_models: usize,
    pub max_audio_models: usize,
    /// Raw request-level options (from the CLI); model options inherit from
    /// these, filtered per recipe
    pub server_options: serde_json::Map<String, Value>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_llm_models: 1,
            max_embedding_models: 1,
            max_reranking_models: 1,
            max_audio_models: 1,
            server_options: serde_json::Map::new(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        for class in ModelClass::ALL {
            if self.capacity(class) == 0 {
                return Err(Error::ConfigError(format!(
                    "max loaded models for the {} class must be at least 1",
                    class
                )));
            }
        }
        Ok(())
    }

    fn capacity(&self, class: ModelClass) -> usize {
        match class {
            ModelClass::Llm => self.max_llm_models,
            ModelClass::Embedding => self.max_embedding_models,
            ModelClass::Reranker => self.max_reranking_models,
            ModelClass::Audio => self.max_audio_models,
        }
    }
}

struct Slot {
    server: SharedBackend,
    class: ModelClass,
    load_time: Instant,
    last_used: Instant,
}

type LoadOutcome = std::result::Result<SharedBackend, Arc<Error>>;
type LoadFuture = Shared<BoxFuture<'static, LoadOutcome>>;

struct ManagerState {
    slots: HashMap<String, Slot>,
    inflight: HashMap<String, LoadFuture>,
    /// Capacity units reserved by loads that have not inserted a slot yet;
    /// counted against the class bound so concurrent starts cannot overshoot
    pending: HashMap<ModelClass, usize>,
}

impl ManagerState {
    fn occupancy(&self, class: ModelClass) -> usize {
        let live = self.slots.values().filter(|s| s.class == class).count();
        live + self.pending.get(&class).copied().unwrap_or(0)
    }

    fn reserve(&mut self, class: ModelClass) {
        *self.pending.entry(class).or_insert(0) += 1;
    }

    fn unreserve(&mut self, class: ModelClass) {
        if let Some(count) = self.pending.get_mut(&class) {
            *count = count.saturating_sub(1);
        }
    }
}

pub struct ModelManager {
    catalog: Arc<RwLock<Catalog>>,
    config: ManagerConfig,
    factory: Arc<dyn BackendFactory>,
    state: Mutex<ManagerState>,
    /// Signaled whenever slots or reservations change, waking loads that
    /// found the pool full of still-starting backends
    capacity_changed: Notify,
}

impl ModelManager {
    pub fn new(
        catalog: Arc<RwLock<Catalog>>,
        config: ManagerConfig,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            catalog,
            config,
            factory,
            state: Mutex::new(ManagerState {
                slots: HashMap::new(),
                inflight: HashMap::new(),
                pending: HashMap::new(),
            }),
            capacity_changed: Notify::new(),
        })
    }

    /// Return the backend serving `model_id`, loading it first if needed.
    /// Concurrent calls for the same id coalesce onto one load; all callers
    /// observe the same result, errors included.
    pub async fn ensure_loaded(self: &Arc<Self>, model_id: &str) -> Result<SharedBackend> {
        let load = {
            let mut state = self.state.lock().await;

            if let Some(slot) = state.slots.get(model_id) {
                let server = slot.server.clone();
                if server.is_running().await {
                    if let Some(slot) = state.slots.get_mut(model_id) {
                        slot.last_used = Instant::now();
                    }
                    return Ok(server);
                }
                // The process died behind our back; drop the slot before
                // anything routes to it, then load fresh.
                warn!("Backend for {} is no longer running; reloading", model_id);
                state.slots.remove(model_id);
                self.capacity_changed.notify_waiters();
            }

            match state.inflight.get(model_id) {
                Some(load) => load.clone(),
                None => {
                    let manager = Arc::clone(self);
                    let id = model_id.to_string();
                    let load: LoadFuture = async move {
                        let result = manager.load_model(&id).await;
                        // The loader clears its own entry before waiters
                        // wake, so a failed load can be retried fresh.
                        manager.state.lock().await.inflight.remove(&id);
                        result.map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    state.inflight.insert(model_id.to_string(), load.clone());
                    load
                }
            }
        };

        load.await.map_err(|e| e.duplicate())
    }

    async fn load_model(&self, model_id: &str) -> Result<SharedBackend> {
        let descriptor = self.catalog.read().await.get(model_id)?.clone();
        let class = descriptor.class();

        let request_options = RecipeOptions::new(descriptor.recipe, &self.config.server_options);
        let options = descriptor.recipe_options().inherit(&request_options)?;

        // Capacity is claimed before the spawn and held as a reservation, so
        // the per-class bound covers backends that are still starting while
        // loads of different models proceed in parallel.
        let victim = self.reserve_capacity(class).await;
        if let Some((victim_id, slot)) = victim {
            info!("Evicting {} to make room for {}", victim_id, model_id);
            slot.server.stop().await;
        }

        let server = match self.factory.create(&descriptor, &options).await {
            Ok(server) => server,
            Err(e) => {
                self.release_reservation(class).await;
                return Err(e);
            }
        };
        if let Err(e) = server.start().await {
            self.release_reservation(class).await;
            return Err(e);
        }

        let mut state = self.state.lock().await;
        state.unreserve(class);
        let now = Instant::now();
        state.slots.insert(
            model_id.to_string(),
            Slot {
                server: server.clone(),
                class,
                load_time: now,
                last_used: now,
            },
        );
        drop(state);
        self.capacity_changed.notify_waiters();
        info!("Loaded {} into the {} pool", model_id, class);
        Ok(server)
    }

    /// Take one capacity unit for `class`, evicting the least-recently-used
    /// slot of the class when the pool is full. The victim comes back
    /// already removed from the pool; the caller stops it synchronously.
    /// When every occupant is itself still starting there is nothing to
    /// evict yet, so wait for a load to settle and retry.
    async fn reserve_capacity(&self, class: ModelClass) -> Option<(String, Slot)> {
        loop {
            let mut notified = std::pin::pin!(self.capacity_changed.notified());
            {
                let mut state = self.state.lock().await;

                if state.occupancy(class) < self.config.capacity(class) {
                    state.reserve(class);
                    return None;
                }

                let victim_id = state
                    .slots
                    .iter()
                    .filter(|(_, slot)| slot.class == class)
                    .min_by_key(|(_, slot)| (slot.last_used, slot.load_time))
                    .map(|(id, _)| id.clone());
                if let Some(id) = victim_id {
                    if let Some(slot) = state.slots.remove(&id) {
                        state.reserve(class);
                        return Some((id, slot));
                    }
                }

                // Register for the wakeup while still holding the lock so a
                // completion between check and await cannot be missed
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    async fn release_reservation(&self, class: ModelClass) {
        self.state.lock().await.unreserve(class);
        self.capacity_changed.notify_waiters();
    }

    /// Stop and remove one slot. A no-op when the model isn't loaded.
    pub async fn unload(&self, model_id: &str) {
        let slot = self.state.lock().await.slots.remove(model_id);
        match slot {
            Some(slot) => {
                info!("Unloading {}", model_id);
                self.capacity_changed.notify_waiters();
                slot.server.stop().await;
            }
            None => warn!("Unload requested for {}, which is not loaded", model_id),
        }
    }

    /// Stop and remove every slot; used at shutdown
    pub async fn unload_all(&self) {
        let slots: Vec<(String, Slot)> = self.state.lock().await.slots.drain().collect();
        self.capacity_changed.notify_waiters();
        for (model_id, slot) in slots {
            info!("Unloading {}", model_id);
            slot.server.stop().await;
        }
    }

    pub async fn list_loaded(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state.slots.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove slots whose process has died, so no request routes to them
    pub async fn reap_dead(&self) -> Vec<String> {
        let mut dead = Vec::new();
        {
            let mut state = self.state.lock().await;
            let ids: Vec<String> = state.slots.keys().cloned().collect();
            for id in ids {
                let running = match state.slots.get(&id) {
                    Some(slot) => slot.server.is_running().await,
                    None => continue,
                };
                if !running {
                    warn!("Reaping dead backend for {}", id);
                    state.slots.remove(&id);
                    dead.push(id);
                }
            }
        }
        if !dead.is_empty() {
            self.capacity_changed.notify_waiters();
        }
        dead
    }
}

//! Worker-local model cache.
//!
//! Models are large; a worker keeps a bounded set resident and evicts by
//! least-recent-use when a new load needs room. Pinned models are never
//! evicted, concurrent loads of one model collapse onto a single in-flight
//! load, and an evictee's memory is released before the replacement's
//! admission is confirmed.

use crate::clock::Clock;
use crate::error::InferenceError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;

const EVICTION_HISTORY: usize = 64;

/// The actual load/unload mechanics, implemented by the embedding worker.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn load(&self, model_id: &str) -> Result<(), InferenceError>;
    /// Must release the model's memory before returning.
    async fn unload(&self, model_id: &str);
}

#[derive(Debug, Clone)]
struct ModelEntry {
    size_bytes: u64,
    pinned: bool,
    uses: u64,
    last_used_ms: u64,
}

enum Slot {
    /// A load is in flight; waiters watch for completion.
    Loading(watch::Receiver<bool>),
    Ready(ModelEntry),
}

/// One record of a model being pushed out.
#[derive(Debug, Clone)]
pub struct EvictionRecord {
    pub model_id: String,
    pub size_bytes: u64,
    pub at_ms: u64,
}

struct CacheInner {
    slots: HashMap<String, Slot>,
    used_bytes: u64,
    history: VecDeque<EvictionRecord>,
}

/// Bounded cache of resident models.
pub struct ModelCache {
    runtime: Arc<dyn ModelRuntime>,
    clock: Arc<dyn Clock>,
    capacity_bytes: u64,
    inner: tokio::sync::Mutex<CacheInner>,
}

impl ModelCache {
    pub fn new(runtime: Arc<dyn ModelRuntime>, clock: Arc<dyn Clock>, capacity_bytes: u64) -> Self {
        Self {
            runtime,
            clock,
            capacity_bytes,
            inner: tokio::sync::Mutex::new(CacheInner {
                slots: HashMap::new(),
                used_bytes: 0,
                history: VecDeque::with_capacity(EVICTION_HISTORY),
            }),
        }
    }

    /// Ensure a model is resident, loading it if needed. `size_bytes` is the
    /// model's declared footprint used for admission accounting.
    pub async fn acquire(&self, model_id: &str, size_bytes: u64) -> Result<(), InferenceError> {
        if size_bytes > self.capacity_bytes {
            return Err(InferenceError::internal(format!(
                "model `{model_id}` ({size_bytes} bytes) exceeds cache capacity"
            )));
        }
        loop {
            let mut waiter = {
                let mut inner = self.inner.lock().await;
                match inner.slots.get_mut(model_id) {
                    Some(Slot::Ready(entry)) => {
                        entry.uses += 1;
                        entry.last_used_ms = self.clock.now_millis();
                        return Ok(());
                    }
                    Some(Slot::Loading(waiting)) => waiting.clone(),
                    None => {
                        // Make room first: memory must be released before the
                        // newcomer's admission is confirmed.
                        self.evict_for(&mut inner, size_bytes, model_id).await?;
                        let (done, waiting) = watch::channel(false);
                        inner.slots.insert(model_id.to_string(), Slot::Loading(waiting));
                        drop(inner);
                        return self.run_load(model_id, size_bytes, done).await;
                    }
                }
            };
            // Another task is loading this model; wait and re-check.
            let _ = waiter.changed().await;
        }
    }

    async fn run_load(
        &self,
        model_id: &str,
        size_bytes: u64,
        done: watch::Sender<bool>,
    ) -> Result<(), InferenceError> {
        let result = self.runtime.load(model_id).await;
        let mut inner = self.inner.lock().await;
        match &result {
            Ok(()) => {
                inner.slots.insert(
                    model_id.to_string(),
                    Slot::Ready(ModelEntry {
                        size_bytes,
                        pinned: false,
                        uses: 1,
                        last_used_ms: self.clock.now_millis(),
                    }),
                );
                inner.used_bytes += size_bytes;
                tracing::info!(model_id, size_bytes, "model loaded");
            }
            Err(err) => {
                inner.slots.remove(model_id);
                tracing::warn!(model_id, code = err.code(), "model load failed");
            }
        }
        drop(inner);
        let _ = done.send(true);
        result
    }

    /// Evict least-recently-used unpinned models until `needed` fits.
    async fn evict_for(
        &self,
        inner: &mut CacheInner,
        needed: u64,
        incoming: &str,
    ) -> Result<(), InferenceError> {
        while inner.used_bytes + needed > self.capacity_bytes {
            let victim = inner
                .slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Ready(entry) if !entry.pinned => Some((id.clone(), entry.last_used_ms)),
                    _ => None,
                })
                .min_by_key(|(_, last_used)| *last_used)
                .map(|(id, _)| id);
            let Some(victim) = victim else {
                return Err(InferenceError::internal(format!(
                    "cannot admit `{incoming}`: remaining models are pinned or loading"
                )));
            };
            let Some(Slot::Ready(entry)) = inner.slots.remove(&victim) else { continue };
            // Release before admission: the unload completes while we still
            // hold the cache lock.
            self.runtime.unload(&victim).await;
            inner.used_bytes -= entry.size_bytes;
            if inner.history.len() == EVICTION_HISTORY {
                inner.history.pop_front();
            }
            inner.history.push_back(EvictionRecord {
                model_id: victim.clone(),
                size_bytes: entry.size_bytes,
                at_ms: self.clock.now_millis(),
            });
            tracing::info!(model_id = %victim, freed = entry.size_bytes, "model evicted");
        }
        Ok(())
    }

    /// Pin a resident model so eviction never touches it.
    pub async fn pin(&self, model_id: &str) -> Result<(), InferenceError> {
        let mut inner = self.inner.lock().await;
        match inner.slots.get_mut(model_id) {
            Some(Slot::Ready(entry)) => {
                entry.pinned = true;
                Ok(())
            }
            _ => Err(InferenceError::validation("modelId", "model not resident")),
        }
    }

    pub async fn unpin(&self, model_id: &str) -> Result<(), InferenceError> {
        let mut inner = self.inner.lock().await;
        match inner.slots.get_mut(model_id) {
            Some(Slot::Ready(entry)) => {
                entry.pinned = false;
                Ok(())
            }
            _ => Err(InferenceError::validation("modelId", "model not resident")),
        }
    }

    /// Resident models, for the worker's advertised skills.
    pub async fn available_models(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut models: Vec<String> = inner
            .slots
            .iter()
            .filter_map(|(id, slot)| matches!(slot, Slot::Ready(_)).then(|| id.clone()))
            .collect();
        models.sort_unstable();
        models
    }

    pub async fn used_bytes(&self) -> u64 {
        self.inner.lock().await.used_bytes
    }

    pub async fn eviction_history(&self) -> Vec<EvictionRecord> {
        self.inner.lock().await.history.iter().cloned().collect()
    }

    /// Access count for a resident model.
    pub async fn uses(&self, model_id: &str) -> Option<u64> {
        let inner = self.inner.lock().await;
        match inner.slots.get(model_id) {
            Some(Slot::Ready(entry)) => Some(entry.uses),
            _ => None,
        }
    }
}

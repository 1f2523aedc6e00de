//! Workspace instance manager.
//!
//! Maps workspace identifiers to lazily constructed [`EngineInstance`]s.
//!
//! # Locking
//!
//! A `std::sync::Mutex` guards only the slot map and is never held across
//! an `.await`. A slot is either `Ready` or `Initializing`. The first
//! caller for an unknown workspace inserts an `Initializing` marker and
//! becomes the leader: it constructs the instance (opens and initializes
//! storage) with no lock held, then publishes the outcome through a
//! `tokio::sync::watch` channel. Callers arriving meanwhile clone the
//! receiver and wait for that outcome, so construction happens once and
//! nobody sees a half-built instance.
//!
//! On failure the marker is removed and followers receive the error; the
//! next call starts over. If the leader is cancelled, a drop guard removes
//! the marker and followers, seeing the channel close, retry.
//!
//! # Shutdown
//!
//! Shutdown closes the instance's storage and forgets it. Background tasks
//! still holding the `Arc` are not cancelled; their next storage call
//! fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use ragspace_core::embedding::Embedder;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::engine::EngineInstance;
use crate::error::{KbError, Result};
use crate::extract::{create_extractor, EntityExtractor};
use crate::storage::{ConfiguredStorageFactory, StorageFactory};
use crate::workspace::WorkspaceId;

type InitOutcome = std::result::Result<Arc<EngineInstance>, String>;

struct CacheEntry {
    instance: Arc<EngineInstance>,
    created_at: DateTime<Utc>,
    last_access: Instant,
}

enum Slot {
    Ready(CacheEntry),
    Initializing(watch::Receiver<Option<InitOutcome>>),
}

enum Step {
    Wait(watch::Receiver<Option<InitOutcome>>),
    Lead(watch::Sender<Option<InitOutcome>>),
}

/// Snapshot of one cached instance.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceInfo {
    pub workspace: String,
    pub created_at: DateTime<Utc>,
}

pub struct WorkspaceManager {
    config: Arc<Config>,
    default_workspace: WorkspaceId,
    factory: Arc<dyn StorageFactory>,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn EntityExtractor>,
    slots: Mutex<HashMap<WorkspaceId, Slot>>,
}

/// Removes a leader's `Initializing` marker if construction is abandoned.
struct InitGuard<'a> {
    manager: &'a WorkspaceManager,
    workspace: WorkspaceId,
    armed: bool,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.manager.lock_slots();
        if matches!(slots.get(&self.workspace), Some(Slot::Initializing(_))) {
            slots.remove(&self.workspace);
            tracing::warn!(workspace = %self.workspace, "instance construction abandoned");
        }
    }
}

impl WorkspaceManager {
    /// Manager with the configured storage backends and model bindings.
    pub fn new(config: Config) -> Result<Self> {
        let factory = Arc::new(ConfiguredStorageFactory::new(config.storage.clone()));
        let embedder =
            create_embedder(&config.embedding).map_err(|e| KbError::Config(format!("{e:#}")))?;
        let extractor = create_extractor(&config.extraction.provider)
            .map_err(|e| KbError::Config(format!("{e:#}")))?;
        Self::with_components(config, factory, embedder, extractor)
    }

    /// Manager with explicit collaborators.
    pub fn with_components(
        config: Config,
        factory: Arc<dyn StorageFactory>,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn EntityExtractor>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| KbError::Config(format!("{e:#}")))?;
        let default_workspace = WorkspaceId::parse(&config.workspace.default)?;

        Ok(Self {
            config: Arc::new(config),
            default_workspace,
            factory,
            embedder,
            extractor,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn default_workspace(&self) -> &WorkspaceId {
        &self.default_workspace
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Normalize and validate an identifier without touching the cache.
    pub fn resolve(&self, raw: Option<&str>) -> Result<WorkspaceId> {
        WorkspaceId::resolve(raw, &self.default_workspace)
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<WorkspaceId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the workspace's instance, constructing it on first use.
    ///
    /// Concurrent callers for the same workspace share one construction.
    pub async fn get_or_create(&self, raw: Option<&str>) -> Result<Arc<EngineInstance>> {
        let workspace = self.resolve(raw)?;

        loop {
            let step = {
                let mut slots = self.lock_slots();
                match slots.get_mut(&workspace) {
                    Some(Slot::Ready(entry)) => {
                        entry.last_access = Instant::now();
                        return Ok(Arc::clone(&entry.instance));
                    }
                    Some(Slot::Initializing(rx)) => Step::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        slots.insert(workspace.clone(), Slot::Initializing(rx));
                        Step::Lead(tx)
                    }
                }
            };

            match step {
                Step::Lead(tx) => return self.lead(workspace, tx).await,
                Step::Wait(mut rx) => {
                    let outcome = rx.wait_for(Option::is_some).await.map(|v| (*v).clone());
                    match outcome {
                        Ok(Some(Ok(instance))) => return Ok(instance),
                        Ok(Some(Err(message))) => {
                            return Err(KbError::InstanceInitializationFailed {
                                workspace: workspace.to_string(),
                                message,
                            })
                        }
                        // Leader went away without an outcome.
                        Ok(None) | Err(_) => continue,
                    }
                }
            }
        }
    }

    async fn lead(
        &self,
        workspace: WorkspaceId,
        tx: watch::Sender<Option<InitOutcome>>,
    ) -> Result<Arc<EngineInstance>> {
        let mut guard = InitGuard {
            manager: self,
            workspace: workspace.clone(),
            armed: true,
        };

        match self.construct(&workspace).await {
            Ok(instance) => {
                let evicted = {
                    let mut slots = self.lock_slots();
                    slots.insert(
                        workspace.clone(),
                        Slot::Ready(CacheEntry {
                            instance: Arc::clone(&instance),
                            created_at: instance.created_at(),
                            last_access: Instant::now(),
                        }),
                    );
                    self.evict_over_capacity(&mut slots, &workspace)
                };
                guard.armed = false;
                let _ = tx.send(Some(Ok(Arc::clone(&instance))));
                tracing::info!(workspace = %workspace, "workspace instance ready");

                for victim in evicted {
                    tokio::spawn(async move {
                        tracing::info!(workspace = %victim.workspace(), "evicting idle workspace instance");
                        if let Err(e) = victim.finalize().await {
                            tracing::error!(workspace = %victim.workspace(), error = %e, "finalize after eviction failed");
                        }
                    });
                }
                Ok(instance)
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.lock_slots().remove(&workspace);
                guard.armed = false;
                let _ = tx.send(Some(Err(message.clone())));
                tracing::error!(workspace = %workspace, error = %message, "workspace initialization failed");
                Err(KbError::InstanceInitializationFailed {
                    workspace: workspace.to_string(),
                    message,
                })
            }
        }
    }

    async fn construct(&self, workspace: &WorkspaceId) -> anyhow::Result<Arc<EngineInstance>> {
        let storage = self.factory.open(workspace).await?;
        let instance = EngineInstance::new(
            workspace.clone(),
            Config::clone(&self.config),
            storage,
            Arc::clone(&self.embedder),
            Arc::clone(&self.extractor),
        );
        if let Err(e) = instance.initialize().await {
            if let Err(close_err) = instance.finalize().await {
                tracing::debug!(workspace = %workspace, error = %close_err, "closing partial storage failed");
            }
            return Err(e);
        }
        Ok(Arc::new(instance))
    }

    /// Drop least-recently-used ready instances (never `keep`) until the
    /// configured bound holds.
    fn evict_over_capacity(
        &self,
        slots: &mut HashMap<WorkspaceId, Slot>,
        keep: &WorkspaceId,
    ) -> Vec<Arc<EngineInstance>> {
        let Some(max) = self.config.workspace.max_instances else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        loop {
            let ready: Vec<(&WorkspaceId, Instant)> = slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Ready(entry) => Some((id, entry.last_access)),
                    Slot::Initializing(_) => None,
                })
                .collect();
            if ready.len() <= max {
                break;
            }
            let Some(victim) = ready
                .into_iter()
                .filter(|(id, _)| *id != keep)
                .min_by_key(|(_, at)| *at)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            if let Some(Slot::Ready(entry)) = slots.remove(&victim) {
                evicted.push(entry.instance);
            }
        }
        evicted
    }

    /// Cached instance only; never constructs.
    pub fn get(&self, raw: Option<&str>) -> Result<Arc<EngineInstance>> {
        let workspace = self.resolve(raw)?;
        let slots = self.lock_slots();
        match slots.get(&workspace) {
            Some(Slot::Ready(entry)) => Ok(Arc::clone(&entry.instance)),
            _ => Err(KbError::InstanceNotFound(workspace.to_string())),
        }
    }

    /// Whether a ready instance is cached for the identifier.
    pub fn contains(&self, raw: Option<&str>) -> bool {
        self.get(raw).is_ok()
    }

    /// Sorted identifiers of ready instances.
    pub fn list_workspaces(&self) -> Vec<String> {
        let slots = self.lock_slots();
        let mut names: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(id, _)| id.to_string())
            .collect();
        names.sort();
        names
    }

    pub fn workspace_info(&self) -> Vec<WorkspaceInfo> {
        let slots = self.lock_slots();
        let mut info: Vec<WorkspaceInfo> = slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Ready(entry) => Some(WorkspaceInfo {
                    workspace: id.to_string(),
                    created_at: entry.created_at,
                }),
                Slot::Initializing(_) => None,
            })
            .collect();
        info.sort_by(|a, b| a.workspace.cmp(&b.workspace));
        info
    }

    pub fn workspace_count(&self) -> usize {
        let slots = self.lock_slots();
        slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Flush, close, and forget a cached instance.
    ///
    /// Returns `false` when nothing ready is cached under the identifier,
    /// including invalid identifiers and instances still being built.
    pub async fn shutdown_workspace(&self, raw: &str) -> bool {
        let Ok(workspace) = self.resolve(Some(raw)) else {
            return false;
        };
        let instance = {
            let mut slots = self.lock_slots();
            match slots.get(&workspace) {
                Some(Slot::Ready(_)) => match slots.remove(&workspace) {
                    Some(Slot::Ready(entry)) => entry.instance,
                    _ => return false,
                },
                _ => return false,
            }
        };

        if let Err(e) = instance.finalize().await {
            tracing::error!(workspace = %workspace, error = %e, "error finalizing workspace storage");
        }
        tracing::info!(workspace = %workspace, "workspace instance shut down");
        true
    }

    /// Shut down every cached instance. Returns how many were shut down.
    pub async fn shutdown_all(&self) -> usize {
        let mut count = 0;
        for name in self.list_workspaces() {
            if self.shutdown_workspace(&name).await {
                count += 1;
            }
        }
        count
    }
}

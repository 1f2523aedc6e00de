#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ragspace::config::{BackendKind, Config};
use ragspace::extract::{EntityExtractor, ExtractionRequest, HeuristicExtractor};
use ragspace::storage::{StorageFactory, StorageSet};
use ragspace::workspace::WorkspaceId;
use ragspace::WorkspaceManager;
use ragspace_core::embedding::{Embedder, HashEmbedder};

pub const DIMS: usize = 64;

/// In-memory factory that counts opens and can fail or stall.
pub struct CountingFactory {
    pub opens: AtomicUsize,
    pub fail_next: AtomicUsize,
    pub delay: Duration,
}

impl CountingFactory {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            opens: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageFactory for CountingFactory {
    async fn open(&self, _workspace: &WorkspaceId) -> anyhow::Result<StorageSet> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("backend unavailable");
        }
        Ok(StorageSet::in_memory())
    }
}

/// Heuristic extraction, except chunks containing `poison` fail.
pub struct PoisonExtractor {
    pub poison: String,
}

#[async_trait]
impl EntityExtractor for PoisonExtractor {
    fn name(&self) -> &str {
        "poison"
    }

    async fn extract(&self, request: ExtractionRequest<'_>) -> anyhow::Result<String> {
        if request.chunk.text.contains(&self.poison) {
            anyhow::bail!("model rejected the chunk");
        }
        HeuristicExtractor.extract(request).await
    }
}

/// Extractor that never answers in time.
pub struct SlowExtractor {
    pub delay: Duration,
}

#[async_trait]
impl EntityExtractor for SlowExtractor {
    fn name(&self) -> &str {
        "slow"
    }

    async fn extract(&self, _request: ExtractionRequest<'_>) -> anyhow::Result<String> {
        tokio::time::sleep(self.delay).await;
        Ok(String::new())
    }
}

/// Heuristic extraction that counts calls.
#[derive(Default)]
pub struct CountingExtractor {
    pub calls: AtomicUsize,
}

#[async_trait]
impl EntityExtractor for CountingExtractor {
    fn name(&self) -> &str {
        "counting"
    }

    async fn extract(&self, request: ExtractionRequest<'_>) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        HeuristicExtractor.extract(request).await
    }
}

/// Hash embedding that yields to the runtime before answering.
pub struct SlowEmbedder {
    pub inner: HashEmbedder,
    pub delay: Duration,
}

impl SlowEmbedder {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: HashEmbedder::new(DIMS),
            delay,
        }
    }
}

#[async_trait]
impl Embedder for SlowEmbedder {
    fn model_name(&self) -> &str {
        "slow-hash"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed(texts).await
    }
}

/// Embedder whose every call fails.
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        anyhow::bail!("embedding service unavailable")
    }
}

pub fn sqlite_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.working_dir = dir.to_path_buf();
    config.storage.kv = BackendKind::Sqlite;
    config.storage.vector = BackendKind::Sqlite;
    config.storage.graph = BackendKind::Sqlite;
    config.storage.doc_status = BackendKind::Sqlite;
    config
}

pub fn manager_with(
    config: Config,
    factory: Arc<dyn StorageFactory>,
    extractor: Arc<dyn EntityExtractor>,
) -> WorkspaceManager {
    WorkspaceManager::with_components(
        config,
        factory,
        Arc::new(HashEmbedder::new(DIMS)),
        extractor,
    )
    .unwrap()
}

pub fn manager_with_embedder(
    config: Config,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn EntityExtractor>,
) -> WorkspaceManager {
    WorkspaceManager::with_components(config, Arc::new(CountingFactory::new()), embedder, extractor)
        .unwrap()
}

pub fn memory_manager() -> WorkspaceManager {
    manager_with(
        Config::default(),
        Arc::new(CountingFactory::new()),
        Arc::new(HeuristicExtractor),
    )
}

pub const ALPHA_DOC: &str = "Alice Smith joined Acme Corporation in Berlin. \
Acme Corporation builds Quantum Widgets for Northwind Traders.";

pub const BETA_DOC: &str = "Bob Jones maintains the Falcon Engine. \
The Falcon Engine powers Orbital Station telemetry.";

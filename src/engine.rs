//! Wiring: builds the cache, backends, validator, executor, one agent per
//! stage and the supervisor from an [`EngineConfig`].

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use uuid::Uuid;

use crate::agents::StageAgent;
use crate::backend::{BackendSelector, GenerativeBackend, LibraryBackend, SharedBackend};
use crate::cache::ArtifactCache;
use crate::config::{EngineConfig, RetryPolicy};
use crate::data::{
    load_dataset, save_dataset, DataRef, Dataset, MemoryBlobStore, RedisBlobStore, SharedBlobStore,
};
use crate::executor::Executor;
use crate::llm::LlmProvider;
use crate::monitor::SharedSink;
use crate::supervisor::{PipelinePlan, PlanReport, Supervisor};
use crate::task::StageKind;
use crate::validation::Validator;

/// A fully wired engine.
pub struct Engine {
    config: EngineConfig,
    store: SharedBlobStore,
    cache: Arc<ArtifactCache>,
    executor: Arc<Executor>,
    supervisor: Supervisor,
}

impl Engine {
    /// Build an engine over `store`. Without a provider only the library
    /// backend is registered.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: EngineConfig,
        store: SharedBlobStore,
        sink: SharedSink,
        provider: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        let mut cache = ArtifactCache::new(config.cache.clone());
        if config.redis_url.is_some() {
            cache = cache.with_store(store.clone());
        }
        let cache = Arc::new(cache);
        let validator = Arc::new(Validator::new(config.validator.clone()));
        let executor = Arc::new(Executor::new(store.clone(), config.limits));

        let generative = provider.map(|provider| {
            Arc::new(GenerativeBackend::new(provider, config.generative.clone())) as SharedBackend
        });
        let selector = build_selector(&config.retry, generative);

        let agents = StageKind::ALL
            .iter()
            .map(|stage| {
                StageAgent::new(
                    *stage,
                    cache.clone(),
                    selector.clone(),
                    validator.clone(),
                    executor.clone(),
                    sink.clone(),
                )
                .with_config(config.agent)
                .with_retry_budget(config.retry.budget)
            })
            .collect();
        let supervisor = Supervisor::new(agents, cache.clone(), sink, config.supervisor.clone());
        info!(backends = selector.len(), "Engine ready");

        Self {
            config,
            store,
            cache,
            executor,
            supervisor,
        }
    }

    /// Open the blob store named by the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis is configured but unreachable.
    pub async fn open_store(config: &EngineConfig) -> anyhow::Result<SharedBlobStore> {
        match &config.redis_url {
            Some(url) => {
                let store = RedisBlobStore::connect(url, "sciforge")
                    .await
                    .with_context(|| format!("Failed to connect to Redis at {}", url))?
                    .with_expiry(config.cache.ttl);
                Ok(Arc::new(store))
            }
            None => Ok(Arc::new(MemoryBlobStore::new())),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedBlobStore {
        &self.store
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Store `data` under a fresh input reference.
    pub async fn stage_input(&self, data: &Dataset) -> anyhow::Result<DataRef> {
        let input = DataRef::new(format!("inputs/{}", Uuid::new_v4()));
        save_dataset(self.store.as_ref(), &input, data)
            .await
            .context("Failed to store input dataset")?;
        Ok(input)
    }

    pub async fn load(&self, data_ref: &DataRef) -> anyhow::Result<Dataset> {
        load_dataset(self.store.as_ref(), data_ref)
            .await
            .with_context(|| format!("Failed to load {}", data_ref))
    }

    /// Store `data` and run `plan` over it.
    pub async fn run_plan(&self, plan: &PipelinePlan, data: &Dataset) -> anyhow::Result<PlanReport> {
        let input = self.stage_input(data).await?;
        let report = self.supervisor.run_plan(plan, input).await?;
        Ok(report)
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

/// Register the library backend and, when given, the generative one, with
/// the policy's ordering.
pub fn build_selector(policy: &RetryPolicy, generative: Option<SharedBackend>) -> BackendSelector {
    let mut selector = BackendSelector::new(policy.fallback_order)
        .with_backend(Arc::new(LibraryBackend::new()) as SharedBackend);
    if let Some(generative) = generative {
        selector = selector.with_backend(generative);
    }
    for (stage, order) in &policy.stage_overrides {
        selector = selector.with_override(*stage, *order);
    }
    selector
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FallbackOrder;
    use crate::monitor::NullSink;
    use serde_json::json;

    #[test]
    fn test_selector_from_policy() {
        let mut policy = RetryPolicy::default();
        policy
            .stage_overrides
            .insert(StageKind::Modeling, FallbackOrder::GenerativeFirst);
        let selector = build_selector(&policy, None);
        assert_eq!(selector.len(), 1);
        assert_eq!(selector.order_for(StageKind::Modeling), FallbackOrder::GenerativeFirst);
        assert_eq!(selector.order_for(StageKind::Cleaning), FallbackOrder::LibraryFirst);
    }

    #[tokio::test]
    async fn test_stage_and_load_input() {
        let config = EngineConfig::default();
        let store = Engine::open_store(&config).await.expect("memory store");
        let engine = Engine::new(config, store, Arc::new(NullSink), None);
        let data = Dataset::new(vec!["a".to_string()], vec![vec![json!(1)], vec![json!(2)]]);

        let input = engine.stage_input(&data).await.expect("stored");
        assert!(input.as_str().starts_with("inputs/"));
        assert_eq!(engine.load(&input).await.expect("loaded"), data);
        assert_eq!(engine.supervisor().stages().len(), 6);
        engine.shutdown().await;
    }
}

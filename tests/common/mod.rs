//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use sciforge::agents::StageAgent;
use sciforge::artifact::{Artifact, BackendKind, Step, TransformProgram};
use sciforge::backend::{
    Backend, BackendRequest, BackendSelector, FallbackOrder, GenerativeBackend, GenerativeConfig,
    SharedBackend,
};
use sciforge::cache::{ArtifactCache, CacheConfig};
use sciforge::data::{save_dataset, DataRef, Dataset, MemoryBlobStore, SharedBlobStore};
use sciforge::error::{BackendError, LlmError};
use sciforge::executor::{Executor, ResourceLimits};
use sciforge::llm::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
use sciforge::monitor::{RecordingSink, SharedSink};
use sciforge::task::StageKind;
use sciforge::validation::{Validator, ValidatorConfig};

/// Forty rows with a few gaps: `age` (integer), `income` (float),
/// `city` (string), `churned` (0/1).
pub fn customers() -> Dataset {
    let cities = ["paris", "lyon", "nantes", "lille"];
    let rows = (0..40)
        .map(|i| {
            let age = if i % 9 == 4 { Value::Null } else { json!(20 + (i * 7) % 45) };
            let income = if i % 11 == 6 {
                Value::Null
            } else {
                json!(30_000.0 + (i as f64) * 1_250.5)
            };
            let city = if i % 13 == 2 { Value::Null } else { json!(cities[i % 4]) };
            vec![age, income, city, json!((i % 3 == 0) as i64)]
        })
        .collect();
    Dataset::new(
        vec![
            "age".to_string(),
            "income".to_string(),
            "city".to_string(),
            "churned".to_string(),
        ],
        rows,
    )
}

/// Same shape as [`customers`] without missing values.
pub fn complete_customers() -> Dataset {
    let mut data = customers();
    for (i, row) in data.rows.iter_mut().enumerate() {
        if row[0].is_null() {
            row[0] = json!(30 + i as i64);
        }
        if row[1].is_null() {
            row[1] = json!(41_000.0 + i as f64);
        }
        if row[2].is_null() {
            row[2] = json!("paris");
        }
    }
    data
}

pub struct Harness {
    pub store: SharedBlobStore,
    pub cache: Arc<ArtifactCache>,
    pub executor: Arc<Executor>,
    pub validator: Arc<Validator>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new() -> Self {
        let store: SharedBlobStore = Arc::new(MemoryBlobStore::new());
        Self {
            cache: Arc::new(ArtifactCache::new(CacheConfig::default())),
            executor: Arc::new(Executor::new(store.clone(), ResourceLimits::default())),
            validator: Arc::new(Validator::new(ValidatorConfig::default())),
            sink: Arc::new(RecordingSink::new()),
            store,
        }
    }

    /// Swap in a differently configured cache.
    pub fn with_cache(mut self, cache: ArtifactCache) -> Self {
        self.cache = Arc::new(cache);
        self
    }

    /// Swap in an executor with different resource ceilings.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.executor = Arc::new(Executor::new(self.store.clone(), limits));
        self
    }

    pub async fn put(&self, key: &str, data: &Dataset) -> DataRef {
        let data_ref = DataRef::new(key);
        save_dataset(self.store.as_ref(), &data_ref, data)
            .await
            .expect("store input");
        data_ref
    }

    pub fn sink(&self) -> SharedSink {
        self.sink.clone()
    }

    pub fn agent(&self, stage: StageKind, backends: Vec<SharedBackend>) -> StageAgent {
        self.agent_with_order(stage, backends, FallbackOrder::LibraryFirst)
    }

    pub fn agent_with_order(
        &self,
        stage: StageKind,
        backends: Vec<SharedBackend>,
        order: FallbackOrder,
    ) -> StageAgent {
        let selector = backends
            .into_iter()
            .fold(BackendSelector::new(order), |s, b| s.with_backend(b));
        StageAgent::new(
            stage,
            self.cache.clone(),
            selector,
            self.validator.clone(),
            self.executor.clone(),
            self.sink(),
        )
    }
}

/// What a [`ScriptedBackend`] does when asked for an artifact.
#[derive(Clone)]
pub enum Script {
    /// Return this program.
    Program(Vec<Step>),
    /// Return this program with synthesized source text attached.
    WithSource(Vec<Step>, String),
    Fail(BackendError),
    /// Wait until cancelled.
    Hang,
}

/// A backend with a fixed answer (optionally per operation) that counts
/// its invocations.
pub struct ScriptedBackend {
    kind: BackendKind,
    script: Script,
    routes: HashMap<String, Script>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind, script: Script) -> Arc<Self> {
        Self::with_delay(kind, script, Duration::ZERO)
    }

    pub fn with_delay(kind: BackendKind, script: Script, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script,
            routes: HashMap::new(),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    /// Answer with `routes[operation]`, falling back to `script`.
    pub fn routed(kind: BackendKind, script: Script, routes: Vec<(&str, Script)>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script,
            routes: routes
                .into_iter()
                .map(|(op, s)| (op.to_string(), s))
                .collect(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn covers(&self, _stage: StageKind, _operation: &str) -> bool {
        true
    }

    fn is_deterministic(&self) -> bool {
        self.kind == BackendKind::Library
    }

    async fn produce(
        &self,
        request: BackendRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<Artifact, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let script = self
            .routes
            .get(&request.task.operation)
            .unwrap_or(&self.script);
        match script {
            Script::Program(steps) => Ok(Artifact::new(self.kind, TransformProgram::new(steps.clone()))),
            Script::WithSource(steps, source) => Ok(Artifact::new(
                self.kind,
                TransformProgram::new(steps.clone()),
            )
            .with_source_text(source.clone())),
            Script::Fail(err) => Err(err.clone()),
            Script::Hang => {
                cancel.cancelled().await;
                Err(BackendError::Cancelled)
            }
        }
    }
}

/// Wraps a backend and counts `produce` calls.
pub struct Counting {
    inner: SharedBackend,
    calls: AtomicUsize,
    delay: Duration,
}

impl Counting {
    pub fn new(inner: SharedBackend) -> Arc<Self> {
        Self::with_delay(inner, Duration::ZERO)
    }

    pub fn with_delay(inner: SharedBackend, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for Counting {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn covers(&self, stage: StageKind, operation: &str) -> bool {
        self.inner.covers(stage, operation)
    }

    fn is_deterministic(&self) -> bool {
        self.inner.is_deterministic()
    }

    async fn produce(
        &self,
        request: BackendRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<Artifact, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.produce(request, cancel).await
    }
}

/// An LLM that always answers with the same text and records prompts.
pub struct CannedProvider {
    reply: Result<String, fn() -> LlmError>,
    pub prompts: Mutex<Vec<String>>,
}

impl CannedProvider {
    pub fn text(reply: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(reply.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(make: fn() -> LlmError) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(make),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("lock").clone()
    }
}

#[async_trait]
impl LlmProvider for CannedProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts.lock().expect("lock").push(prompt);
        match &self.reply {
            Ok(text) => Ok(GenerationResponse {
                id: "canned".to_string(),
                model: "canned".to_string(),
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(text.clone()),
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage::default(),
            }),
            Err(make) => Err(make()),
        }
    }
}

pub fn generative(provider: Arc<CannedProvider>) -> SharedBackend {
    Arc::new(GenerativeBackend::new(provider, GenerativeConfig::default()))
}

/// A program that references a column the data does not have.
pub fn broken_program() -> Vec<Step> {
    vec![Step::SelectColumns {
        columns: vec!["ghost".to_string()],
    }]
}

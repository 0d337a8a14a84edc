//! LLM-backed artifact synthesis.
//!
//! The model is shown the step language, the task and the input schema, and
//! must answer with `{"steps": [...], "rationale": "..."}`. Anything else is a
//! synthesis failure; transport problems make the backend unavailable for the
//! rest of the task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Backend, BackendRequest};
use crate::artifact::{Artifact, BackendKind, Step, TransformProgram};
use crate::error::BackendError;
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::metrics::{MetricsCollector, TokenUsage};
use crate::task::StageKind;
use crate::utils::json_extraction::try_extract_json_object;

/// System prompt describing the transform language.
const SYSTEM_PROMPT: &str = r#"You write data transformation programs for a tabular dataset.

A program is a JSON object: {"steps": [...], "rationale": "<one sentence>"}.
Each step is an object with an "op" field. Available ops:

Wrangling:
  {"op": "select_columns", "columns": [..]}
  {"op": "drop_columns", "columns": [..]}
  {"op": "rename_column", "from": "a", "to": "b"}
  {"op": "cast_column", "column": "a", "to": "integer|float|boolean|string"}
  {"op": "normalize_text", "column": "a", "lowercase": true, "trim": true}
  {"op": "merge", "source": "<stored dataset key>", "on": ["key"], "how": "inner|left|outer"}
Cleaning:
  {"op": "fill_missing", "column": "a" (omit for all), "strategy": "drop|mean|median|mode|constant", "value": <for constant>}
  {"op": "drop_duplicates", "subset": [..] (optional)}
  {"op": "drop_missing_rows", "columns": [..] (optional)}
  {"op": "clip_outliers", "column": "a", "z": 3.0}
Feature engineering:
  {"op": "derive", "name": "new", "expr": <expr>}
  {"op": "interaction", "columns": ["a", "b"], "name": "a_x_b" (optional)}
  {"op": "one_hot_encode", "column": "a", "prefix": "p" (optional), "max_categories": 20}
  {"op": "datetime_parts", "column": "a", "parts": ["year|quarter|month|day|weekday|day_of_year|hour|minute"], "prefix": "p" (optional)}
  {"op": "drop_constant_columns"}
  {"op": "drop_correlated_columns", "threshold": 0.95}
  {"op": "sample_rows", "max_rows": 1000}
Analysis:
  {"op": "describe", "columns": [..] (optional)}
  {"op": "correlate", "columns": [..] (optional)}
Modeling and interpretation:
  {"op": "baseline_model", "target": "y", "holdout_every": 5}
  {"op": "feature_importance", "target": "y"}

Expressions: {"column": "a"}, {"literal": 1.5}, {"add": [e, e]}, {"sub": [e, e]},
{"mul": [e, e]}, {"div": [e, e]}, {"pow": [e, e]}, {"neg": e}, {"log": e}, {"abs": e}.
"log" computes ln(1 + x).

Rules:
- Only reference columns that exist at that point of the program.
- Never use network, shell or file operations.
- Only merge datasets the task explicitly names.
- Answer with the JSON object only."#;

/// Configuration for the generative backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerativeConfig {
    /// Model name; empty uses the provider default.
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Deadline for a single synthesis call.
    #[serde(with = "crate::cache::duration_secs")]
    pub timeout: Duration,
    /// Stages this backend accepts work for.
    pub stages: Vec<StageKind>,
}

impl Default for GenerativeConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.2,
            max_tokens: 2000,
            timeout: Duration::from_secs(60),
            stages: StageKind::ALL.to_vec(),
        }
    }
}

impl GenerativeConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stages(mut self, stages: Vec<StageKind>) -> Self {
        self.stages = stages;
        self
    }
}

/// The JSON object a model is asked to return.
#[derive(Debug, Deserialize)]
struct SynthesizedProgram {
    steps: Vec<Step>,
    #[serde(default)]
    rationale: Option<String>,
}

/// Backend that asks an LLM to write the transform program.
pub struct GenerativeBackend {
    provider: Arc<dyn LlmProvider>,
    config: GenerativeConfig,
    metrics: MetricsCollector,
}

impl GenerativeBackend {
    pub fn new(provider: Arc<dyn LlmProvider>, config: GenerativeConfig) -> Self {
        Self {
            provider,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &GenerativeConfig {
        &self.config
    }

    fn render_prompt(&self, request: &BackendRequest<'_>) -> String {
        let task = request.task;
        let mut prompt = format!(
            "Stage: {}\nOperation: {}\nParameters: {}\n\nInput columns:\n",
            task.stage, task.operation, task.params
        );
        for field in &request.input_schema.fields {
            prompt.push_str(&format!("- {} ({})\n", field.name, field.dtype));
        }
        if let Some(expected) = &task.expected_schema {
            prompt.push_str("\nThe output must contain these columns:\n");
            for field in &expected.fields {
                prompt.push_str(&format!("- {} ({})\n", field.name, field.dtype));
            }
        }
        if !request.prior_failures.is_empty() {
            prompt.push_str("\nPrevious attempts were rejected:\n");
            for reason in request.prior_failures {
                prompt.push_str(&format!("- {}\n", reason));
            }
            prompt.push_str("Write a program that avoids these problems.\n");
        }
        prompt
    }
}

/// Parse a model answer into a program and optional rationale.
///
/// # Errors
///
/// Returns `BackendError::SynthesisFailed` if no JSON object can be
/// extracted or it does not describe a program.
pub fn parse_program(content: &str) -> Result<(TransformProgram, Option<String>), BackendError> {
    let json = try_extract_json_object(content)
        .into_result_with_context(content)
        .map_err(|e| BackendError::SynthesisFailed(e.to_string()))?;
    let parsed: SynthesizedProgram = serde_json::from_str(&json)
        .map_err(|e| BackendError::SynthesisFailed(format!("not a valid program: {}", e)))?;
    Ok((TransformProgram::new(parsed.steps), parsed.rationale))
}

#[async_trait]
impl Backend for GenerativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Generative
    }

    fn covers(&self, stage: StageKind, _operation: &str) -> bool {
        self.config.stages.contains(&stage)
    }

    fn is_deterministic(&self) -> bool {
        false
    }

    async fn produce(
        &self,
        request: BackendRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<Artifact, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let generation = GenerationRequest::new(
            self.config.model.clone(),
            vec![
                Message::system(SYSTEM_PROMPT),
                Message::user(self.render_prompt(&request)),
            ],
        )
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens);

        let model_label = if self.config.model.is_empty() {
            "default"
        } else {
            self.config.model.as_str()
        };
        let started = Instant::now();
        let call = tokio::time::timeout(self.config.timeout, self.provider.generate(generation));
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            outcome = call => outcome,
        };
        let latency = started.elapsed().as_secs_f64();

        let response = match outcome {
            Err(_) => {
                self.metrics
                    .record_llm_request(model_label, false, latency, TokenUsage::default());
                warn!(task_id = %request.task.id, timeout = ?self.config.timeout, "Synthesis timed out");
                return Err(BackendError::Timeout(self.config.timeout));
            }
            Ok(Err(e)) => {
                self.metrics
                    .record_llm_request(model_label, false, latency, TokenUsage::default());
                warn!(task_id = %request.task.id, error = %e, "Synthesis request failed");
                return Err(if e.is_transport() {
                    BackendError::Unavailable(e.to_string())
                } else {
                    BackendError::SynthesisFailed(e.to_string())
                });
            }
            Ok(Ok(response)) => response,
        };

        self.metrics.record_llm_request(
            model_label,
            true,
            latency,
            TokenUsage::new(
                response.usage.prompt_tokens as u64,
                response.usage.completion_tokens as u64,
            ),
        );

        let content = response
            .first_content()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| BackendError::SynthesisFailed("empty response".to_string()))?;
        let (program, rationale) = parse_program(content)?;
        debug!(
            task_id = %request.task.id,
            steps = program.len(),
            latency_ms = (latency * 1000.0) as u64,
            "Synthesized program"
        );

        let mut artifact = Artifact::new(BackendKind::Generative, program).with_source_text(content);
        if let Some(rationale) = rationale {
            artifact = artifact.with_rationale(rationale);
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataRef, DataType, Schema};
    use crate::error::LlmError;
    use crate::llm::{Choice, GenerationResponse, Usage};
    use crate::task::Task;
    use serde_json::json;
    use std::sync::Mutex;

    enum Reply {
        Text(String),
        Fail(fn() -> LlmError),
        Hang,
    }

    struct MockProvider {
        reply: Reply,
        prompts: Mutex<Vec<String>>,
    }

    impl MockProvider {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            let user = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            self.prompts.lock().expect("lock").push(user);
            match &self.reply {
                Reply::Text(content) => Ok(GenerationResponse {
                    id: "resp".to_string(),
                    model: "mock".to_string(),
                    choices: vec![Choice {
                        index: 0,
                        message: Message::assistant(content.clone()),
                        finish_reason: "stop".to_string(),
                    }],
                    usage: Usage::default(),
                }),
                Reply::Fail(make) => Err(make()),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(LlmError::RequestFailed("unreachable".to_string()))
                }
            }
        }
    }

    fn task() -> Task {
        Task::new(StageKind::Cleaning, DataRef::new("in"), "clean", json!({"instructions": "fix"}))
    }

    fn schema() -> Schema {
        Schema::default().with_field("price", DataType::Float)
    }

    async fn produce_with(provider: Arc<MockProvider>, config: GenerativeConfig) -> Result<Artifact, BackendError> {
        let task = task();
        let schema = schema();
        GenerativeBackend::new(provider, config)
            .produce(BackendRequest::new(&task, &schema), CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_parses_fenced_program() {
        let content = "Sure.\n```json\n{\"steps\": [{\"op\": \"fill_missing\", \"column\": \"price\", \"strategy\": \"median\"}], \"rationale\": \"median is robust\"}\n```";
        let artifact = produce_with(MockProvider::new(Reply::Text(content.to_string())), GenerativeConfig::default())
            .await
            .expect("artifact");
        assert_eq!(artifact.source, BackendKind::Generative);
        assert_eq!(artifact.program.len(), 1);
        assert_eq!(artifact.rationale.as_deref(), Some("median is robust"));
        assert_eq!(artifact.source_text.as_deref(), Some(content));
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let unavailable = produce_with(
            MockProvider::new(Reply::Fail(|| LlmError::RequestFailed("connection refused".to_string()))),
            GenerativeConfig::default(),
        )
        .await;
        assert!(matches!(unavailable, Err(BackendError::Unavailable(_))));

        let bad_answer = produce_with(
            MockProvider::new(Reply::Fail(|| LlmError::ParseError("bad json".to_string()))),
            GenerativeConfig::default(),
        )
        .await;
        assert!(matches!(bad_answer, Err(BackendError::SynthesisFailed(_))));

        let prose = produce_with(
            MockProvider::new(Reply::Text("I cannot help with that.".to_string())),
            GenerativeConfig::default(),
        )
        .await;
        assert!(matches!(prose, Err(BackendError::SynthesisFailed(_))));

        let unknown_op = produce_with(
            MockProvider::new(Reply::Text(r#"{"steps": [{"op": "train_xgboost"}]}"#.to_string())),
            GenerativeConfig::default(),
        )
        .await;
        assert!(matches!(unknown_op, Err(BackendError::SynthesisFailed(_))));
    }

    #[tokio::test]
    async fn test_deadline_and_cancellation() {
        let timed_out = produce_with(
            MockProvider::new(Reply::Hang),
            GenerativeConfig::default().with_timeout(Duration::from_millis(20)),
        )
        .await;
        assert_eq!(timed_out, Err(BackendError::Timeout(Duration::from_millis(20))));

        let task = task();
        let schema = schema();
        let backend = GenerativeBackend::new(MockProvider::new(Reply::Hang), GenerativeConfig::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = backend.produce(BackendRequest::new(&task, &schema), cancel).await;
        assert_eq!(result, Err(BackendError::Cancelled));
    }

    #[tokio::test]
    async fn test_prompt_carries_schema_and_prior_failures() {
        let provider = MockProvider::new(Reply::Text(r#"{"steps": []}"#.to_string()));
        let backend = GenerativeBackend::new(provider.clone(), GenerativeConfig::default());
        let task = task();
        let schema = schema();
        let failures = vec!["column 'prcie' not found".to_string()];
        backend
            .produce(
                BackendRequest::new(&task, &schema).with_prior_failures(&failures),
                CancellationToken::new(),
            )
            .await
            .expect("empty program still parses");

        let prompts = provider.prompts.lock().expect("lock");
        assert!(prompts[0].contains("- price (float)"));
        assert!(prompts[0].contains("column 'prcie' not found"));
    }

    #[test]
    fn test_covers_configured_stages() {
        let backend = GenerativeBackend::new(
            MockProvider::new(Reply::Text(String::new())),
            GenerativeConfig::default().with_stages(vec![StageKind::Modeling]),
        );
        assert!(backend.covers(StageKind::Modeling, "anything"));
        assert!(!backend.covers(StageKind::Cleaning, "clean"));
    }
}

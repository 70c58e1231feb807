//! Shared fixtures: scripted providers and an in-memory orchestrator harness.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use resume_orchestrator::config::OrchestratorConfig;
use resume_orchestrator::models::{NewTask, Task};
use resume_orchestrator::orchestration::{BatchSummary, HandlerDependencies, Orchestrator, Worker};
use resume_orchestrator::providers::{
    EmbeddingProvider, InMemoryContentStore, InMemoryVectorIndex, LlmProvider, LlmRequest,
    ProviderError, ProviderResult,
};
use resume_orchestrator::store::{InMemoryTaskStore, TaskStore};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const DIMENSIONS: usize = 4;

/// Longer than any backoff the test configuration can produce
pub const PAST_ANY_BACKOFF: Duration = Duration::from_secs(3600);

pub fn valid_report_json(score: i64) -> String {
    json!({
        "score": score,
        "matched": [{"skill": "Rust", "evidence": [
            {"source": "resume", "excerpt": "Five years of Rust", "chunk_index": 0}
        ]}],
        "missing": [{"skill": "Kubernetes", "evidence": [
            {"source": "job", "excerpt": "Operate Kubernetes clusters", "chunk_index": null}
        ]}],
        "weak": [],
        "change_log": ["Led with Rust experience"],
        "preview_markdown": "# Jane Doe\n\nSenior Rust engineer"
    })
    .to_string()
}

pub fn valid_entities_json() -> String {
    json!({
        "skills": ["Rust", "Python"],
        "tools": ["PostgreSQL"],
        "education": [],
        "experience": [{
            "role": "Senior Engineer",
            "company": "Acme Storage",
            "duration": "2019-2024",
            "highlights": ["Led a team of four"]
        }],
        "contact": {"email": "jane@example.com", "phone": null, "linkedin": null}
    })
    .to_string()
}

pub fn service_unavailable() -> ProviderError {
    ProviderError::api(503, "upstream overloaded")
}

const ENTITIES_SCHEMA: &str = "extracted_entities";

/// LLM that replays a script, then repeats a fallback reply. Entity
/// extraction requests are answered separately and kept out of the script.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<ProviderResult<String>>>,
    fallback: ProviderResult<String>,
    requests: Mutex<Vec<LlmRequest>>,
    entities: ProviderResult<String>,
    entity_requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new(script: Vec<ProviderResult<String>>, fallback: ProviderResult<String>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
            entities: Ok(valid_entities_json()),
            entity_requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer entity extraction with `reply`
    pub fn with_entities(mut self, reply: ProviderResult<String>) -> Self {
        self.entities = reply;
        self
    }

    pub fn entity_calls(&self) -> usize {
        self.entity_requests.lock().len()
    }

    /// Always answers with a valid report
    pub fn valid() -> Self {
        Self::new(Vec::new(), Ok(valid_report_json(80)))
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn generate(&self, request: LlmRequest) -> ProviderResult<String> {
        let is_entity_request = request
            .response_schema
            .as_ref()
            .is_some_and(|schema| schema.name == ENTITIES_SCHEMA);
        if is_entity_request {
            self.entity_requests.lock().push(request);
            return self.entities.clone();
        }
        self.requests.lock().push(request);
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Deterministic embeddings derived from the text bytes
#[derive(Default)]
pub struct HashEmbeddings {
    calls: AtomicUsize,
    failure: Mutex<Option<ProviderError>>,
    non_finite: AtomicBool,
}

impl HashEmbeddings {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Answer every later request with `error`
    pub fn fail_with(&self, error: ProviderError) {
        *self.failure.lock() = Some(error);
    }

    /// Put a NaN into the first component of every later vector
    pub fn emit_non_finite(&self) {
        self.non_finite.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddings {
    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    async fn embed(&self, texts: &[String]) -> ProviderResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![1.0_f32; DIMENSIONS];
                for (idx, byte) in text.bytes().enumerate() {
                    vector[idx % DIMENSIONS] += f32::from(byte) / 255.0;
                }
                if self.non_finite.load(Ordering::SeqCst) {
                    vector[0] = f32::NAN;
                }
                vector
            })
            .collect())
    }
}

pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.worker.batch_size = 10;
    config.worker.max_concurrency = 4;
    config.worker.lease_duration_seconds = 30;
    config.worker.handler_timeout_seconds = 5;
    config.worker.reliability_report_interval_seconds = 0;
    config.chunking.target_chars = 120;
    config.chunking.overlap_chars = 20;
    config.optimize.top_k = 3;
    config
}

/// Orchestrator over in-memory collaborators, with handles on each of them
pub struct Harness {
    pub store: Arc<InMemoryTaskStore>,
    pub content: Arc<InMemoryContentStore>,
    pub vectors: Arc<InMemoryVectorIndex>,
    pub llm: Arc<ScriptedLlm>,
    pub embeddings: Arc<HashEmbeddings>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(llm: ScriptedLlm) -> Self {
        Self::with_config(llm, test_config())
    }

    pub fn with_config(llm: ScriptedLlm, config: OrchestratorConfig) -> Self {
        let store = Arc::new(InMemoryTaskStore::new());
        let content = Arc::new(InMemoryContentStore::new());
        let vectors = Arc::new(InMemoryVectorIndex::new());
        let llm = Arc::new(llm);
        let embeddings = Arc::new(HashEmbeddings::default());

        let deps = HandlerDependencies::new(
            content.clone(),
            llm.clone(),
            embeddings.clone(),
            vectors.clone(),
        );
        let orchestrator = Orchestrator::new(store.clone(), deps, config);

        Self {
            store,
            content,
            vectors,
            llm,
            embeddings,
            orchestrator,
        }
    }

    pub fn worker(&self) -> Worker {
        self.orchestrator.worker()
    }

    /// A user owning one job and one resume version
    pub fn seed_documents(&self) -> Fixture {
        let fixture = Fixture {
            user_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            resume_version_id: Uuid::new_v4(),
        };
        self.content.insert_job(
            fixture.job_id,
            fixture.user_id,
            "We are hiring a senior Rust engineer to build distributed queue workers. \
             You will operate Kubernetes clusters and mentor other engineers.",
        );
        self.content.insert_resume_version(
            fixture.resume_version_id,
            fixture.user_id,
            "Jane Doe. Five years of Rust building storage engines and task schedulers. \
             Previously Python backend developer. Led a team of four.",
        );
        fixture
    }

    pub async fn enqueue(&self, task: NewTask) -> Task {
        let id = self.orchestrator.enqueue(task).await.unwrap();
        self.store.task(id).unwrap()
    }

    /// Run `worker` batch after batch, skipping past backoff delays, until
    /// nothing is claimable
    pub async fn drain(&self, worker: &Worker) -> BatchSummary {
        let mut total = BatchSummary::default();
        for _ in 0..50 {
            let summary = worker.run_once().await.unwrap();
            if summary.claimed == 0 {
                return total;
            }
            total.claimed += summary.claimed;
            total.completed += summary.completed;
            total.retried += summary.retried;
            total.failed += summary.failed;
            total.stale += summary.stale;
            total.store_errors += summary.store_errors;
            self.store.advance_clock(PAST_ANY_BACKOFF);
        }
        panic!("queue did not drain after 50 batches");
    }

    pub async fn optimization_count(&self, job_id: Uuid) -> usize {
        self.store.optimizations_for_job(job_id).await.unwrap().len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Fixture {
    pub user_id: Uuid,
    pub job_id: Uuid,
    pub resume_version_id: Uuid,
}

impl Fixture {
    pub fn optimize(&self) -> NewTask {
        NewTask::optimize(self.user_id, self.job_id, self.resume_version_id)
    }

    pub fn embed_resume(&self) -> NewTask {
        NewTask::embed_resume(self.user_id, self.resume_version_id)
    }

    pub fn embed_job(&self) -> NewTask {
        NewTask::embed_job(self.user_id, self.job_id)
    }
}

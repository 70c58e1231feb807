//! # Optimize Handler
//!
//! Produces a scored, evidence-backed optimization report for one resume
//! version against one job description.
//!
//! ## Pipeline
//!
//! 1. Load the job and resume version, both owned by the requesting user
//! 2. Fingerprint the inputs; an equivalent result stored since this task
//!    was enqueued completes the task as deduplicated without provider calls
//! 3. Embed the job description and retrieve the top-K resume chunks
//! 4. One structured-output completion, validated rule by rule
//! 5. Best-effort entity extraction (skills, tools, education, experience,
//!    contact) from the resume; an unusable reply stores no entities
//! 6. If the preview is not in the desired language, one best-effort
//!    translation call; its failure keeps the original preview

use super::{check_finite, owned_document, wrong_payload, HandlerDependencies, HandlerResult, TaskHandler};
use crate::config::OptimizeConfig;
use crate::models::{
    ClaimedTask, ExtractedEntities, NewOptimizationResult, OptimizationReport, OptimizePayload,
    ReportReliability, TaskFailure, TaskOutput, TaskPayload, TaskType,
};
use crate::orchestration::language::{
    arabic_ratio, language_instructions, needs_translation, translation_prompt,
};
use crate::orchestration::report_validator::parse_report;
use crate::providers::{LlmRequest, ProviderError, ResponseSchema, VectorMatch};
use crate::store::TaskStore;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

const SCHEMA_NAME: &str = "optimization_report";
const ENTITIES_SCHEMA_NAME: &str = "extracted_entities";
const TRANSLATION_TEMPERATURE: f32 = 0.2;
const ENTITY_TEMPERATURE: f32 = 0.3;

const ENTITY_PROMPT: &str = "You are a resume parser. Extract structured information from the resume.

Return JSON with ALL of these fields (use [] when nothing is found):
- skills: technical and soft skills
- tools: tools and technologies mentioned
- education: degrees and certifications
- experience: one {role, company, duration, highlights} entry per position
- contact: {email, phone, linkedin}, or null when the resume lists none

Copy values as written in the resume. Never invent details.";

const SYSTEM_PROMPT: &str = "You are an expert resume optimization assistant.
Analyze the resume against the job description and provide ALL of the following:
1. score: A match score from 0-100 (integer, required)
2. matched: Job requirements the resume already covers, each with evidence
3. missing: Job requirements absent from the resume, each with evidence from the job description
4. weak: Requirements the resume only partially supports, each with evidence
5. change_log: Specific changes made in the preview (list of strings, use [] if none)
6. preview_markdown: An improved resume in Markdown format (string, required)

Evidence items quote the source verbatim. For resume evidence taken from a numbered
excerpt, set chunk_index to that excerpt's number; otherwise use null.
Never invent experience the resume does not support.

IMPORTANT: Always include ALL fields in your response. Respond in valid JSON format.";

/// SHA-256 over everything that determines an optimization result
pub fn input_fingerprint(payload: &OptimizePayload, resume_text: &str, job_text: &str) -> String {
    let mut hasher = Sha256::new();
    let fields: [&[u8]; 8] = [
        payload.job_id.as_bytes(),
        payload.resume_version_id.as_bytes(),
        resume_text.as_bytes(),
        job_text.as_bytes(),
        payload.instructions.as_deref().unwrap_or("").as_bytes(),
        payload.resume_lang.as_deref().unwrap_or("").as_bytes(),
        payload.jd_lang.as_deref().unwrap_or("").as_bytes(),
        payload.target_lang().as_bytes(),
    ];
    for field in fields {
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    format!("{:x}", hasher.finalize())
}

/// User prompt: full texts, retrieved excerpts, and free-form instructions
pub fn build_user_prompt(
    resume_text: &str,
    job_text: &str,
    excerpts: &[VectorMatch],
    instructions: Option<&str>,
) -> String {
    let mut prompt = format!("Resume:\n{resume_text}\n\nJob Description:\n{job_text}\n\n");
    if !excerpts.is_empty() {
        prompt.push_str("Most relevant resume excerpts:\n");
        for excerpt in excerpts {
            prompt.push_str(&format!("[{}] {}\n", excerpt.chunk_index, excerpt.text.trim()));
        }
        prompt.push('\n');
    }
    let instructions = instructions.map(str::trim).filter(|s| !s.is_empty());
    prompt.push_str(&format!(
        "Additional Instructions:\n{}",
        instructions.unwrap_or("None")
    ));
    prompt
}

pub struct OptimizeHandler {
    deps: HandlerDependencies,
    store: Arc<dyn TaskStore>,
    config: OptimizeConfig,
    /// Longest job description prefix embedded for retrieval, in characters
    query_chars: usize,
}

impl OptimizeHandler {
    pub fn new(
        deps: HandlerDependencies,
        store: Arc<dyn TaskStore>,
        config: OptimizeConfig,
        query_chars: usize,
    ) -> Self {
        Self {
            deps,
            store,
            config,
            query_chars: query_chars.max(1),
        }
    }

    fn provider_failure(&self, operation: &str, error: ProviderError) -> TaskFailure {
        self.deps.classifier.failure_for(operation, &error)
    }

    async fn retrieve_excerpts(
        &self,
        payload: &OptimizePayload,
        job_text: &str,
    ) -> Result<Vec<VectorMatch>, TaskFailure> {
        if self.config.top_k == 0 {
            return Ok(Vec::new());
        }
        let query: String = job_text.chars().take(self.query_chars).collect();
        let mut vectors = self
            .deps
            .embeddings
            .embed(&[query])
            .await
            .map_err(|e| self.provider_failure("embedding job description", e))?;
        if vectors.len() != 1 {
            return Err(TaskFailure::validation(format!(
                "embedding provider returned {} vectors for 1 query",
                vectors.len()
            )));
        }
        check_finite(&vectors)?;
        let query_vector = vectors.remove(0);

        let mut matches = self
            .deps
            .vectors
            .query(
                payload.user_id,
                &query_vector,
                self.config.top_k,
                Some(payload.resume_version_id),
            )
            .await
            .map_err(|e| self.provider_failure("vector query", e))?;
        // Present excerpts in document order
        matches.sort_by_key(|m| m.chunk_index);
        Ok(matches)
    }

    async fn generate_report(
        &self,
        payload: &OptimizePayload,
        user_prompt: String,
    ) -> Result<OptimizationReport, TaskFailure> {
        let system_prompt = format!(
            "{SYSTEM_PROMPT}\n\n{}",
            language_instructions(
                payload.resume_lang.as_deref(),
                payload.jd_lang.as_deref(),
                payload.target_lang(),
            )
        );
        let request = LlmRequest::new(system_prompt, user_prompt)
            .temperature(self.config.temperature)
            .response_schema(ResponseSchema::of::<OptimizationReport>(SCHEMA_NAME));

        let raw = self
            .deps
            .llm
            .generate(request)
            .await
            .map_err(|e| self.provider_failure("llm completion", e).after_llm_call())?;

        parse_report(&raw).map_err(|e| TaskFailure::invalid_output(e.to_string()))
    }

    async fn extract_entities(&self, resume_text: &str) -> Option<ExtractedEntities> {
        if !self.config.entity_extraction_enabled {
            return None;
        }
        let request = LlmRequest::new(ENTITY_PROMPT, resume_text)
            .temperature(ENTITY_TEMPERATURE)
            .response_schema(ResponseSchema::of::<ExtractedEntities>(ENTITIES_SCHEMA_NAME));

        let raw = match self.deps.llm.generate(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Entity extraction failed; storing report without entities");
                return None;
            }
        };
        match serde_json::from_str::<ExtractedEntities>(raw.trim()) {
            Ok(entities) => {
                debug!(
                    skills = entities.skills.len(),
                    positions = entities.experience.len(),
                    "Entities extracted"
                );
                Some(entities)
            }
            Err(e) => {
                warn!(error = %e, "Unparseable entity reply; storing report without entities");
                None
            }
        }
    }

    /// Translate the preview when it drifted from the target language.
    /// Returns whether the preview was replaced.
    async fn ensure_language(&self, report: &mut OptimizationReport, target_lang: &str) -> bool {
        if !self.config.translation_enabled
            || !needs_translation(
                &report.preview_markdown,
                target_lang,
                self.config.translation_threshold,
            )
        {
            return false;
        }

        info!(
            target_lang,
            arabic_ratio = arabic_ratio(&report.preview_markdown),
            "Translating preview"
        );
        let request = LlmRequest::new(
            translation_prompt(target_lang),
            report.preview_markdown.clone(),
        )
        .temperature(TRANSLATION_TEMPERATURE);

        match self.deps.llm.generate(request).await {
            Ok(translated) if !translated.trim().is_empty() => {
                report.preview_markdown = translated.trim().to_string();
                true
            }
            Ok(_) => {
                warn!("Translation returned empty text; keeping original preview");
                false
            }
            Err(e) => {
                warn!(error = %e, "Translation failed; keeping original preview");
                false
            }
        }
    }

    async fn optimize(&self, claimed: &ClaimedTask, payload: &OptimizePayload) -> HandlerResult {
        let started = Instant::now();
        let content = &self.deps.content;

        let job = content
            .job(payload.job_id)
            .await
            .map_err(|e| self.provider_failure("content lookup", e))?;
        let job = owned_document(job, "job", payload.job_id, payload.user_id)?;
        let resume = content
            .resume_version(payload.resume_version_id)
            .await
            .map_err(|e| self.provider_failure("content lookup", e))?;
        let resume = owned_document(
            resume,
            "resume version",
            payload.resume_version_id,
            payload.user_id,
        )?;

        let fingerprint = input_fingerprint(payload, &resume.text, &job.text);
        let existing = self
            .store
            .find_optimization(payload.job_id, &fingerprint, claimed.task.created_at)
            .await
            .map_err(|e| TaskFailure::transient(format!("result lookup: {e}")))?;
        if let Some(existing) = existing {
            debug!(existing_result_id = %existing.id, "Equivalent result already stored");
            return Ok(TaskOutput::Deduplicated {
                existing_result_id: existing.id,
            });
        }

        let excerpts = self.retrieve_excerpts(payload, &job.text).await?;
        let user_prompt = build_user_prompt(
            &resume.text,
            &job.text,
            &excerpts,
            payload.instructions.as_deref(),
        );
        let mut report = self.generate_report(payload, user_prompt).await?;
        let entities = self.extract_entities(&resume.text).await;
        let translated = self.ensure_language(&mut report, payload.target_lang()).await;

        let result = NewOptimizationResult {
            job_id: payload.job_id,
            owner_id: payload.user_id,
            resume_version_id: payload.resume_version_id,
            input_fingerprint: fingerprint,
            report,
            entities,
            reliability: ReportReliability {
                model: self.deps.llm.model().to_string(),
                attempt_no: claimed.task.claim_count,
                retrieved_chunks: excerpts.len(),
                translated,
                latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            },
        };
        Ok(TaskOutput::Optimized(Box::new(result)))
    }
}

#[async_trait]
impl TaskHandler for OptimizeHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Optimize
    }

    #[instrument(skip_all, fields(task_id = %claimed.id(), job_id = tracing::field::Empty))]
    async fn handle(&self, claimed: &ClaimedTask, payload: &TaskPayload) -> HandlerResult {
        let TaskPayload::Optimize(payload) = payload else {
            return Err(wrong_payload(TaskType::Optimize, payload));
        };
        tracing::Span::current().record("job_id", tracing::field::display(payload.job_id));
        self.optimize(claimed, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn payload() -> OptimizePayload {
        OptimizePayload {
            user_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            resume_version_id: Uuid::new_v4(),
            instructions: None,
            resume_lang: Some("en".into()),
            jd_lang: None,
            desired_output_lang: None,
        }
    }

    #[test]
    fn test_fingerprint_is_stable_and_input_sensitive() {
        let payload = payload();
        let a = input_fingerprint(&payload, "resume", "job");
        assert_eq!(a, input_fingerprint(&payload, "resume", "job"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, input_fingerprint(&payload, "resume!", "job"));
        assert_ne!(a, input_fingerprint(&payload, "resum", "ejob"));

        let mut arabic = payload.clone();
        arabic.desired_output_lang = Some("ar".into());
        assert_ne!(a, input_fingerprint(&arabic, "resume", "job"));
    }

    #[test]
    fn test_user_prompt_layout() {
        let excerpts = vec![VectorMatch {
            source_id: Uuid::new_v4(),
            chunk_index: 2,
            text: "Led migration to Rust ".into(),
            score: 0.9,
        }];
        let prompt = build_user_prompt("R", "J", &excerpts, Some("  "));
        assert_eq!(
            prompt,
            "Resume:\nR\n\nJob Description:\nJ\n\nMost relevant resume excerpts:\n[2] Led migration to Rust\n\nAdditional Instructions:\nNone"
        );
        let no_excerpts = build_user_prompt("R", "J", &[], Some("Keep it short"));
        assert!(no_excerpts.ends_with("Additional Instructions:\nKeep it short"));
        assert!(!no_excerpts.contains("excerpts"));
    }
}

//! End-to-end worker scenarios against the in-memory store.

mod common;

use common::{service_unavailable, Harness, ScriptedLlm, PAST_ANY_BACKOFF};
use resume_orchestrator::models::{AttemptOutcome, EntityRef, FailureKind, NewTask};
use resume_orchestrator::providers::{ProviderError, VectorIndex};
use resume_orchestrator::store::TaskStore;
use resume_orchestrator::{EntityStatus, OrchestratorError, TaskStatus};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

#[tokio::test]
async fn test_transient_failures_then_success() {
    let llm = ScriptedLlm::new(
        vec![Err(service_unavailable()), Err(service_unavailable())],
        Ok(common::valid_report_json(72)),
    );
    let harness = Harness::new(llm);
    let fixture = harness.seed_documents();
    let task = harness
        .enqueue(fixture.optimize().with_max_attempts(3))
        .await;

    let worker = harness.worker();
    let summary = harness.drain(&worker).await;
    assert_eq!(summary.retried, 2);
    assert_eq!(summary.completed, 1);

    let task = harness.store.task(task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(task.attempts, 2);
    assert_eq!(harness.optimization_count(fixture.job_id).await, 1);
    assert_eq!(harness.llm.calls(), 3);

    let attempts = harness.store.attempts_for_task(task.id).await.unwrap();
    let outcomes: Vec<_> = attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::Transient,
            AttemptOutcome::Transient,
            AttemptOutcome::Succeeded
        ]
    );
    let numbers: Vec<_> = attempts.iter().map(|a| a.attempt_no).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    let view = harness
        .orchestrator
        .status(EntityRef::job(fixture.job_id))
        .await
        .unwrap();
    assert_eq!(view.status, EntityStatus::Complete);
    let result = view.result.expect("latest result");
    assert_eq!(result.score, 72);
    assert_eq!(result.version_no, 1);
    assert_eq!(result.report.0.reliability.attempt_no, 3);
    assert!(view.error_summary.is_none());
}

#[tokio::test]
async fn test_malformed_output_exhausts_attempts() {
    let llm = ScriptedLlm::new(
        vec![
            Ok("Sure! Here is the improved resume.".into()),
            Ok("{\"score\": 80".into()),
            Ok("{\"score\": 180}".into()),
        ],
        Ok(common::valid_report_json(90)),
    );
    let harness = Harness::new(llm);
    let fixture = harness.seed_documents();
    let task = harness
        .enqueue(fixture.optimize().with_max_attempts(3))
        .await;

    let worker = harness.worker();
    let summary = harness.drain(&worker).await;
    assert_eq!(summary.retried, 2);
    assert_eq!(summary.failed, 1);

    let task = harness.store.task(task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.last_error_kind, Some(FailureKind::Validation));
    assert!(task.last_error.unwrap().starts_with("validation:"));
    assert_eq!(harness.optimization_count(fixture.job_id).await, 0);
    assert_eq!(harness.llm.calls(), 3);

    let view = harness
        .orchestrator
        .status(EntityRef::job(fixture.job_id))
        .await
        .unwrap();
    assert_eq!(view.status, EntityStatus::Failed);
    assert_eq!(
        view.error_summary.as_deref(),
        Some(FailureKind::Validation.user_summary())
    );

    let report = harness.orchestrator.reliability_report().await.unwrap();
    assert_eq!(report.invalid_outputs, 3);
    assert_eq!(report.total_optimize_attempts, 3);
    assert!((report.invalid_output_rate() - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_failures_before_the_llm_leave_invalid_output_rate_alone() {
    let harness = Harness::new(ScriptedLlm::valid());
    harness
        .embeddings
        .fail_with(ProviderError::Parse("missing data array".into()));
    let fixture = harness.seed_documents();
    let task = harness
        .enqueue(fixture.optimize().with_max_attempts(3))
        .await;

    let worker = harness.worker();
    let summary = harness.drain(&worker).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(harness.llm.calls(), 0);

    // Still a retryable validation failure on the task itself
    let task = harness.store.task(task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.last_error_kind, Some(FailureKind::Validation));

    let attempts = harness.store.attempts_for_task(task.id).await.unwrap();
    assert_eq!(attempts.len(), 3);
    assert!(attempts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::Validation && !a.llm_called));

    let report = harness.orchestrator.reliability_report().await.unwrap();
    assert_eq!(report.total_optimize_attempts, 0);
    assert_eq!(report.invalid_outputs, 0);
    assert_eq!(report.invalid_output_rate(), 0.0);
}

#[tokio::test]
async fn test_transient_llm_errors_count_as_attempts_but_not_invalid_output() {
    let llm = ScriptedLlm::new(vec![Err(service_unavailable())], Ok(common::valid_report_json(70)));
    let harness = Harness::new(llm);
    let fixture = harness.seed_documents();
    harness.enqueue(fixture.optimize()).await;

    let worker = harness.worker();
    harness.drain(&worker).await;

    let report = harness.orchestrator.reliability_report().await.unwrap();
    assert_eq!(report.total_optimize_attempts, 2);
    assert_eq!(report.transient_failures, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.invalid_outputs, 0);
}

#[tokio::test]
async fn test_back_to_back_embeds_are_serialized_and_overwrite() {
    let harness = Harness::new(ScriptedLlm::valid());
    let fixture = harness.seed_documents();
    let first = harness.enqueue(fixture.embed_resume()).await;
    let second = harness.enqueue(fixture.embed_resume()).await;

    let worker = harness.worker();
    let batch = worker.run_once().await.unwrap();
    assert_eq!(batch.claimed, 1);
    assert_eq!(batch.completed, 1);
    assert_eq!(
        harness.store.task(first.id).unwrap().status,
        TaskStatus::Complete
    );

    // Skipped while the first was in flight, never touched
    let untouched = harness.store.task(second.id).unwrap();
    assert_eq!(untouched.status, TaskStatus::Queued);
    assert_eq!(untouched.claim_count, 0);
    assert_eq!(untouched.lease_version, 0);
    assert_eq!(untouched.updated_at, second.updated_at);

    let indexed = harness
        .vectors
        .count(fixture.user_id, fixture.resume_version_id)
        .await
        .unwrap();
    assert!(indexed > 0);

    let batch = worker.run_once().await.unwrap();
    assert_eq!(batch.completed, 1);
    assert_eq!(
        harness.store.task(second.id).unwrap().status,
        TaskStatus::Complete
    );
    let reindexed = harness
        .vectors
        .count(fixture.user_id, fixture.resume_version_id)
        .await
        .unwrap();
    assert_eq!(reindexed, indexed);
    assert_eq!(harness.embeddings.calls(), 2);

    let view = harness
        .orchestrator
        .status(EntityRef::resume_version(fixture.resume_version_id))
        .await
        .unwrap();
    assert_eq!(view.status, EntityStatus::Complete);
}

#[tokio::test]
async fn test_poll_leases_no_more_than_it_can_run() {
    let mut config = common::test_config();
    config.worker.batch_size = 3;
    config.worker.max_concurrency = 1;
    let harness = Harness::with_config(ScriptedLlm::valid(), config);
    let tasks = [
        harness.enqueue(harness.seed_documents().embed_job()).await,
        harness.enqueue(harness.seed_documents().embed_job()).await,
        harness.enqueue(harness.seed_documents().embed_job()).await,
    ];

    let worker = harness.worker();
    let batch = worker.run_once().await.unwrap();
    assert_eq!(batch.claimed, 1);
    assert_eq!(batch.completed, 1);

    // Waiting tasks hold no lease that could run down before they start
    for waiting in &tasks[1..] {
        let task = harness.store.task(waiting.id).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.claim_owner.is_none());
        assert_eq!(task.claim_count, 0);
    }

    let summary = harness.drain(&worker).await;
    assert_eq!(summary.claimed, 2);
    assert_eq!(summary.stale, 0);
    for task in &tasks {
        let task = harness.store.task(task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert_eq!(task.claim_count, 1);
    }
    assert_eq!(harness.embeddings.calls(), 3);
}

#[tokio::test]
async fn test_non_finite_embeddings_never_reach_the_index() {
    let harness = Harness::new(ScriptedLlm::valid());
    harness.embeddings.emit_non_finite();
    let fixture = harness.seed_documents();
    let task = harness
        .enqueue(fixture.embed_job().with_max_attempts(1))
        .await;

    let worker = harness.worker();
    assert_eq!(harness.drain(&worker).await.failed, 1);

    let task = harness.store.task(task.id).unwrap();
    assert_eq!(task.last_error_kind, Some(FailureKind::Validation));
    assert!(task.last_error.unwrap().contains("non-finite"));
    let indexed = harness
        .vectors
        .count(fixture.user_id, fixture.job_id)
        .await
        .unwrap();
    assert_eq!(indexed, 0);
}

#[tokio::test]
async fn test_double_submitted_optimize_produces_one_result() {
    let harness = Harness::new(ScriptedLlm::valid());
    let fixture = harness.seed_documents();
    let first = harness.enqueue(fixture.optimize()).await;
    let second = harness.enqueue(fixture.optimize()).await;

    let worker = harness.worker();
    let batch = worker.run_once().await.unwrap();
    assert_eq!(batch.claimed, 1, "same job must not run twice at once");

    harness.drain(&worker).await;
    for id in [first.id, second.id] {
        assert_eq!(harness.store.task(id).unwrap().status, TaskStatus::Complete);
    }
    assert_eq!(harness.optimization_count(fixture.job_id).await, 1);
    assert_eq!(harness.llm.calls(), 1);

    let attempts = harness.store.attempts_for_task(second.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Deduplicated);
}

#[tokio::test]
async fn test_changed_instructions_produce_new_version() {
    let harness = Harness::new(ScriptedLlm::valid());
    let fixture = harness.seed_documents();
    harness.enqueue(fixture.optimize()).await;
    let worker = harness.worker();
    harness.drain(&worker).await;

    let mut task = fixture.optimize();
    if let resume_orchestrator::models::TaskPayload::Optimize(payload) = &mut task.payload {
        payload.instructions = Some("Emphasise leadership".into());
    }
    harness.enqueue(task).await;
    harness.drain(&worker).await;

    let results = harness
        .store
        .optimizations_for_job(fixture.job_id)
        .await
        .unwrap();
    let versions: Vec<_> = results.iter().map(|r| r.version_no).collect();
    assert_eq!(versions, vec![1, 2]);
    assert_ne!(results[0].input_fingerprint, results[1].input_fingerprint);
    assert_eq!(harness.llm.calls(), 2);
}

#[tokio::test]
async fn test_optimize_prompt_includes_retrieved_resume_chunks() {
    let harness = Harness::new(ScriptedLlm::valid());
    let fixture = harness.seed_documents();
    harness.enqueue(fixture.embed_resume()).await;
    harness.enqueue(fixture.embed_job()).await;
    let worker = harness.worker();
    assert_eq!(harness.drain(&worker).await.completed, 2);

    harness.enqueue(fixture.optimize()).await;
    harness.drain(&worker).await;

    let requests = harness.llm.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].user_prompt.contains("Most relevant resume excerpts:"));
    assert!(requests[0].response_schema.is_some());

    let results = harness
        .store
        .optimizations_for_job(fixture.job_id)
        .await
        .unwrap();
    assert!(results[0].report.0.reliability.retrieved_chunks > 0);
}

#[tokio::test]
async fn test_optimize_stores_entities_extracted_from_the_resume() {
    let harness = Harness::new(ScriptedLlm::valid());
    let fixture = harness.seed_documents();
    harness.enqueue(fixture.optimize()).await;
    let worker = harness.worker();
    assert_eq!(harness.drain(&worker).await.completed, 1);

    let entity_requests = harness.llm.entity_calls();
    assert_eq!(entity_requests, 1);
    let results = harness
        .store
        .optimizations_for_job(fixture.job_id)
        .await
        .unwrap();
    let entities = results[0].report.0.entities.clone().unwrap();
    assert_eq!(entities.skills, vec!["Rust", "Python"]);
    assert_eq!(entities.experience[0].company, "Acme Storage");
    assert_eq!(
        entities.contact.and_then(|contact| contact.email).as_deref(),
        Some("jane@example.com")
    );
}

#[tokio::test]
async fn test_unusable_entity_reply_keeps_the_report() {
    for reply in [Ok("{\"skills\": \"Rust\"}".to_string()), Err(service_unavailable())] {
        let harness = Harness::new(ScriptedLlm::valid().with_entities(reply));
        let fixture = harness.seed_documents();
        let task = harness.enqueue(fixture.optimize()).await;
        let worker = harness.worker();

        let summary = harness.drain(&worker).await;
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.retried, 0);
        assert_eq!(harness.store.task(task.id).unwrap().status, TaskStatus::Complete);

        let results = harness
            .store
            .optimizations_for_job(fixture.job_id)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].report.0.entities, None);
        assert_eq!(results[0].score, 80);
    }
}

#[tokio::test]
async fn test_entity_extraction_can_be_disabled() {
    let mut config = common::test_config();
    config.optimize.entity_extraction_enabled = false;
    let harness = Harness::with_config(ScriptedLlm::valid(), config);
    let fixture = harness.seed_documents();
    harness.enqueue(fixture.optimize()).await;
    let worker = harness.worker();
    assert_eq!(harness.drain(&worker).await.completed, 1);

    assert_eq!(harness.llm.entity_calls(), 0);
    assert_eq!(harness.llm.calls(), 1);
    let results = harness
        .store
        .optimizations_for_job(fixture.job_id)
        .await
        .unwrap();
    assert_eq!(results[0].report.0.entities, None);
}

#[tokio::test]
async fn test_rejected_report_skips_entity_extraction() {
    let llm = ScriptedLlm::new(Vec::new(), Ok("not json".to_string()));
    let harness = Harness::new(llm);
    let fixture = harness.seed_documents();
    harness.enqueue(fixture.optimize().with_max_attempts(1)).await;
    let worker = harness.worker();
    assert_eq!(harness.drain(&worker).await.failed, 1);

    assert_eq!(harness.llm.entity_calls(), 0);
}

#[tokio::test]
async fn test_foreign_job_fails_without_retry() {
    let harness = Harness::new(ScriptedLlm::valid());
    let fixture = harness.seed_documents();
    let stranger = Uuid::new_v4();
    let task = harness
        .enqueue(NewTask::optimize(
            stranger,
            fixture.job_id,
            fixture.resume_version_id,
        ))
        .await;

    let worker = harness.worker();
    let summary = harness.drain(&worker).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.retried, 0);

    let task = harness.store.task(task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.last_error_kind, Some(FailureKind::Permanent));
    assert_eq!(harness.llm.calls(), 0);
}

#[tokio::test]
async fn test_attempts_never_decrease_and_terminal_status_sticks() {
    let llm = ScriptedLlm::new(
        vec![
            Err(service_unavailable()),
            Ok("not json".into()),
            Err(service_unavailable()),
        ],
        Ok(common::valid_report_json(50)),
    );
    let harness = Harness::new(llm);
    let fixture = harness.seed_documents();
    let task = harness
        .enqueue(fixture.optimize().with_max_attempts(5))
        .await;
    let worker = harness.worker();

    let mut last_attempts = 0;
    let mut reached_terminal = false;
    for _ in 0..8 {
        worker.run_once().await.unwrap();
        harness.store.advance_clock(PAST_ANY_BACKOFF);

        let current = harness.store.task(task.id).unwrap();
        assert!(current.attempts >= last_attempts);
        assert!(current.attempts <= current.max_attempts);
        if reached_terminal {
            assert!(current.status.is_terminal());
        }
        reached_terminal = current.status.is_terminal();
        last_attempts = current.attempts;
    }

    let task = harness.store.task(task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(task.attempts, 3);
}

#[tokio::test]
async fn test_enqueue_applies_default_budget_and_rejects_zero() {
    let harness = Harness::new(ScriptedLlm::valid());
    let fixture = harness.seed_documents();

    let task = harness.enqueue(fixture.embed_job()).await;
    assert_eq!(task.max_attempts, 3);
    assert_eq!(task.status, TaskStatus::Queued);

    let err = harness
        .orchestrator
        .enqueue(fixture.embed_job().with_max_attempts(0))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
}

#[tokio::test]
async fn test_status_of_unknown_entity_is_not_found() {
    let harness = Harness::new(ScriptedLlm::valid());
    let err = harness
        .orchestrator
        .status(EntityRef::job(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_status_reports_queued_then_processing() {
    let harness = Harness::new(ScriptedLlm::valid());
    let fixture = harness.seed_documents();
    harness.enqueue(fixture.optimize()).await;
    let entity = EntityRef::job(fixture.job_id);

    let view = harness.orchestrator.status(entity).await.unwrap();
    assert_eq!(view.status, EntityStatus::Queued);
    assert!(view.result.is_none());

    harness
        .store
        .claim("observer", 1, Duration::from_secs(30))
        .await
        .unwrap();
    let view = harness.orchestrator.status(entity).await.unwrap();
    assert_eq!(view.status, EntityStatus::Processing);
}

#[tokio::test]
async fn test_run_loop_processes_until_shutdown() {
    let mut config = common::test_config();
    config.worker.poll_interval_ms = 10;
    let harness = Harness::with_config(ScriptedLlm::valid(), config);
    let fixture = harness.seed_documents();
    let task = harness.enqueue(fixture.embed_job()).await;

    let worker = harness.worker();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let store = harness.store.clone();

    let observed = async {
        loop {
            if store.task(task.id).unwrap().status == TaskStatus::Complete {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send(true).unwrap();
    };

    let (run, ()) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(worker.run(shutdown_rx), observed)
    })
    .await
    .expect("worker did not stop");
    run.unwrap();

    let stats = worker.stats();
    assert_eq!(stats.completed, 1);
    assert!(stats.batches >= 1);
}

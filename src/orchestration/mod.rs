//! # Orchestration Engine
//!
//! Everything between a queued task row and its committed outcome.
//!
//! ## Architecture
//!
//! The [`worker::Worker`] poll loop drives one batch at a time:
//!
//! 1. **TaskClaimer** leases a FIFO batch with one task per idempotency key
//! 2. **TaskProcessor** runs each task through its **TaskHandler**, under a timeout
//! 3. **ResultWriter** commits the output together with task completion, or
//!    **RetryController** classifies the failure and reschedules or fails it
//!
//! Every commit is guarded by the claim's lease; a worker that lost its lease
//! has its write rejected as stale.
//!
//! ## Core Components
//!
//! - **Orchestrator**: wiring plus the `enqueue` and `status` operations
//! - **BackoffCalculator**: capped exponential delays with upward jitter
//! - **ErrorClassifier**: maps provider errors onto transient, validation, or permanent
//! - **IdempotencyGuard**: at most one in-flight task per `(task_type, target_id)`
//! - **TextChunker**: overlapping character windows for embedding
//! - **report_validator**: rule-by-rule checks of model output

pub mod backoff_calculator;
pub mod chunker;
pub mod core;
pub mod error_classifier;
pub mod handlers;
pub mod idempotency;
pub mod language;
pub mod report_validator;
pub mod result_writer;
pub mod retry_controller;
pub mod task_claimer;
pub mod task_processor;
pub mod worker;

pub use backoff_calculator::{BackoffCalculator, BackoffCalculatorConfig, BackoffResult, BackoffType};
pub use chunker::{TextChunk, TextChunker};
pub use self::core::Orchestrator;
pub use error_classifier::{ErrorCategory, ErrorClassification, ErrorClassifier};
pub use handlers::{EmbedHandler, HandlerDependencies, HandlerResult, OptimizeHandler, TaskHandler};
pub use idempotency::{IdempotencyGuard, IdempotencyKey};
pub use report_validator::{parse_report, ValidationError};
pub use result_writer::ResultWriter;
pub use retry_controller::{FailReason, FailureResolution, RetryController, RetryDecision};
pub use task_claimer::{TaskClaimer, TaskClaimerConfig};
pub use task_processor::TaskProcessor;
pub use worker::{BatchSummary, TaskResolution, Worker, WorkerStats, WorkerStatsSnapshot};

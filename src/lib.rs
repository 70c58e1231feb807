#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Resume Orchestrator
//!
//! Background task-queue worker for resume and job-description processing.
//!
//! ## Overview
//!
//! Producers enqueue three kinds of work: embedding a resume version,
//! embedding a job description, and optimizing a resume against a job. A pool
//! of workers claims tasks from a durable queue under a lease, runs them
//! against LLM, embedding, and vector-index providers, and commits the result
//! in the same transaction that completes the task.
//!
//! ## Key Features
//!
//! - **Lease-based claiming**: FIFO, `FOR UPDATE SKIP LOCKED`, visibility timeouts
//! - **Idempotency**: one in-flight task per `(task_type, target_id)`; input
//!   fingerprints deduplicate optimization results
//! - **Classified failures**: transient errors back off exponentially, invalid
//!   model output is retried, permanent errors fail immediately
//! - **Guarded writes**: a worker that lost its lease cannot overwrite a newer claim
//!
//! ## Module Organization
//!
//! - [`models`] - Tasks, payloads, reports, and status views
//! - [`store`] - Durable task queue: PostgreSQL and in-memory implementations
//! - [`database`] - Connection pooling and migrations
//! - [`state_machine`] - Task and entity status transitions
//! - [`orchestration`] - Claiming, processing, retries, and the worker loop
//! - [`providers`] - LLM, embedding, vector-index, and content-store seams
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resume_orchestrator::config::ConfigManager;
//! use resume_orchestrator::models::NewTask;
//! use resume_orchestrator::Orchestrator;
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::from_config(ConfigManager::load()?).await?;
//! let task_id = orchestrator
//!     .enqueue(NewTask::embed_resume(Uuid::new_v4(), Uuid::new_v4()))
//!     .await?;
//! println!("queued {task_id}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                           # Unit and in-memory scenario tests
//! cargo test --features postgres-tests # PostgreSQL store tests (DATABASE_URL)
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod providers;
pub mod state_machine;
pub mod store;

pub use config::{ConfigManager, OrchestratorConfig};
pub use error::{OrchestratorError, Result};
pub use orchestration::Orchestrator;
pub use state_machine::{EntityStatus, TaskStatus};

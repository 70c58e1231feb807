//! # Orchestrator
//!
//! Single entry point that wires configuration, store, providers, and the
//! worker together, and exposes the two inbound operations: `enqueue` and
//! `status`.
//!
//! ```rust,no_run
//! use resume_orchestrator::config::ConfigManager;
//! use resume_orchestrator::models::{EntityRef, NewTask};
//! use resume_orchestrator::orchestration::Orchestrator;
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::from_config(ConfigManager::load()?).await?;
//! let (user, job) = (Uuid::new_v4(), Uuid::new_v4());
//!
//! orchestrator.enqueue(NewTask::embed_job(user, job)).await?;
//! let view = orchestrator.status(EntityRef::job(job)).await?;
//! println!("{} is {:?}", view.entity, view.embedding_status);
//! # Ok(())
//! # }
//! ```

use crate::config::{ConfigManager, OrchestratorConfig, VectorIndexBackend};
use crate::database::{run_migrations, DatabaseConnection};
use crate::error::{OrchestratorError, Result};
use crate::models::{EntityRef, EntityStatusView, NewTask, ReliabilityReport};
use crate::orchestration::handlers::HandlerDependencies;
use crate::orchestration::task_processor::TaskProcessor;
use crate::orchestration::worker::Worker;
use crate::providers::{
    llm_from_config, InMemoryVectorIndex, OpenAiEmbeddings, PgContentStore, PgVectorIndex,
    VectorIndex,
};
use crate::store::{PgTaskStore, TaskStore};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    processor: Arc<TaskProcessor>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Orchestrator over an existing store and collaborators
    pub fn new(
        store: Arc<dyn TaskStore>,
        deps: HandlerDependencies,
        config: OrchestratorConfig,
    ) -> Self {
        let processor = TaskProcessor::with_default_handlers(deps, store.clone(), &config);
        Self::with_processor(store, Arc::new(processor), config)
    }

    /// Orchestrator with a custom handler set
    pub fn with_processor(
        store: Arc<dyn TaskStore>,
        processor: Arc<TaskProcessor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            processor,
            config,
        }
    }

    /// Connect to PostgreSQL, optionally migrate, and build the providers
    /// described by `config_manager`: the configured chat backend and
    /// OpenAI-compatible embeddings
    pub async fn from_config(config_manager: Arc<ConfigManager>) -> Result<Self> {
        let config = config_manager.config().clone();
        info!(
            environment = config_manager.environment(),
            llm_provider = ?config.llm.provider,
            llm_model = config.llm.model(),
            vector_index = ?config.vector_index.backend,
            "Initializing orchestrator"
        );
        debug!(config = %config_manager.debug_config(), "Effective configuration");

        let connection = DatabaseConnection::connect(&config.database).await?;
        let pool = connection.pool().clone();
        if config.database.run_migrations {
            run_migrations(&pool).await?;
        }

        let llm = llm_from_config(&config.llm)?;
        let embeddings = Arc::new(OpenAiEmbeddings::new(config.embedding.clone())?);
        let vectors: Arc<dyn VectorIndex> = match config.vector_index.backend {
            VectorIndexBackend::Postgres => Arc::new(PgVectorIndex::new(pool.clone())),
            VectorIndexBackend::Memory => Arc::new(InMemoryVectorIndex::new()),
        };
        let deps = HandlerDependencies::new(
            Arc::new(PgContentStore::new(pool.clone())),
            llm,
            embeddings,
            vectors,
        );

        Ok(Self::new(Arc::new(PgTaskStore::new(pool)), deps, config))
    }

    /// Queue a task; the per-task budget defaults to `worker.default_max_attempts`
    #[instrument(skip_all, fields(task_type = %task.task_type()))]
    pub async fn enqueue(&self, task: NewTask) -> Result<Uuid> {
        let task = match task.max_attempts {
            Some(max) if max < 1 => {
                return Err(OrchestratorError::validation(format!(
                    "max_attempts must be at least 1, got {max}"
                )))
            }
            Some(_) => task,
            None => {
                let default = i32::try_from(self.config.worker.default_max_attempts)
                    .unwrap_or(i32::MAX);
                task.with_max_attempts(default)
            }
        };

        let stored = self.store.enqueue(&task).await?;
        info!(task_id = %stored.id, target = %stored.target(), "Task enqueued");
        Ok(stored.id)
    }

    /// Status of a job or resume version
    pub async fn status(&self, entity: EntityRef) -> Result<EntityStatusView> {
        self.store
            .status(entity)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(entity.to_string()))
    }

    pub async fn reliability_report(&self) -> Result<ReliabilityReport> {
        self.store.reliability_report().await
    }

    /// A new poll-loop worker sharing this orchestrator's store and handlers
    pub fn worker(&self) -> Worker {
        Worker::new(
            self.store.clone(),
            self.processor.clone(),
            &self.config.worker,
            &self.config.backoff,
        )
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}

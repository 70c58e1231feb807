//! # Schema Migrations
//!
//! The `migrations/` directory is embedded at compile time with
//! `sqlx::migrate!`. Applied versions are tracked in `_sqlx_migrations`, the
//! same table `#[sqlx::test(migrations = "./migrations")]` uses, and sqlx
//! serialises concurrent runs with its own advisory lock, so several workers
//! may start with `database.run_migrations = true` at once.

use sqlx::PgPool;
use tracing::info;

/// Every migration under `migrations/`, in version order
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Result type for migration operations
pub type MigrationResult<T> = Result<T, sqlx::migrate::MigrateError>;

/// Apply every migration not yet recorded against `pool`
pub async fn run_migrations(pool: &PgPool) -> MigrationResult<()> {
    info!(available = MIGRATOR.iter().count(), "Running database migrations");
    MIGRATOR.run(pool).await?;
    info!("Database migrations complete");
    Ok(())
}

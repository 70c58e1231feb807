//! # Database
//!
//! Connection pooling and schema migrations for the PostgreSQL store.
//!
//! - [`connection`] - pool construction from configuration, health checks
//! - [`migrator`] - `sqlx::migrate!` over `migrations/`

pub mod connection;
pub mod migrator;

pub use connection::DatabaseConnection;
pub use migrator::{run_migrations, MIGRATOR};

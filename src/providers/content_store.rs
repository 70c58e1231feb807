//! Access to resume and job description text.

use super::{ContentStore, Document, ProviderResult};
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(FromRow)]
struct DocumentRow {
    id: Uuid,
    owner_id: Uuid,
    text: String,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            text: row.text,
        }
    }
}

/// Reads `resume_versions` (owner via `resumes`) and `jobs`
#[derive(Debug, Clone)]
pub struct PgContentStore {
    pool: PgPool,
}

impl PgContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentStore for PgContentStore {
    async fn resume_version(&self, id: Uuid) -> ProviderResult<Option<Document>> {
        // Prefer the normalised Markdown over the raw extraction
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT rv.id, r.user_id AS owner_id,
                   COALESCE(NULLIF(rv.content_md, ''), rv.raw_text, '') AS text
            FROM resume_versions rv
            JOIN resumes r ON r.id = rv.resume_id
            WHERE rv.id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Document::from))
    }

    async fn job(&self, id: Uuid) -> ProviderResult<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT id, user_id AS owner_id, job_description AS text FROM jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Document::from))
    }
}

/// Process-local content, for development and tests
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    resume_versions: DashMap<Uuid, Document>,
    jobs: DashMap<Uuid, Document>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_resume_version(&self, id: Uuid, owner_id: Uuid, text: impl Into<String>) {
        self.resume_versions.insert(
            id,
            Document {
                id,
                owner_id,
                text: text.into(),
            },
        );
    }

    pub fn insert_job(&self, id: Uuid, owner_id: Uuid, description: impl Into<String>) {
        self.jobs.insert(
            id,
            Document {
                id,
                owner_id,
                text: description.into(),
            },
        );
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn resume_version(&self, id: Uuid) -> ProviderResult<Option<Document>> {
        Ok(self.resume_versions.get(&id).map(|doc| doc.value().clone()))
    }

    async fn job(&self, id: Uuid) -> ProviderResult<Option<Document>> {
        Ok(self.jobs.get(&id).map(|doc| doc.value().clone()))
    }
}

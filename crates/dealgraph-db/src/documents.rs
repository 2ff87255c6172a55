//! Documents and their parsed chunks.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use dealgraph_core::{
    Chunk, ChunkType, Document, DocumentRepository, DocumentStatus, Error, Namespace, Result,
    Vector,
};

const DOCUMENT_COLUMNS: &str =
    "id, organization_id, deal_id, name, status, error_message, summary, created_at";

pub struct PgDocumentRepository {
    pool: Pool<Postgres>,
}

impl PgDocumentRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_document_row(row: sqlx::postgres::PgRow) -> Result<Document> {
        let status: String = row.try_get("status")?;
        Ok(Document {
            id: row.try_get("id")?,
            organization_id: row.try_get("organization_id")?,
            deal_id: row.try_get("deal_id")?,
            name: row.try_get("name")?,
            status: status.parse::<DocumentStatus>()?,
            error_message: row.try_get("error_message")?,
            summary: row.try_get("summary")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn parse_chunk_row(row: sqlx::postgres::PgRow) -> Result<Chunk> {
        let chunk_type: String = row.try_get("chunk_type")?;
        Ok(Chunk {
            id: row.try_get("id")?,
            document_id: row.try_get("document_id")?,
            content: row.try_get("content")?,
            chunk_index: row.try_get("chunk_index")?,
            page_number: row.try_get("page_number")?,
            sheet_name: row.try_get("sheet_name")?,
            chunk_type: chunk_type.parse::<ChunkType>()?,
        })
    }

    async fn touch(&self, id: Uuid, sql: &str, value: Option<&str>) -> Result<()> {
        let result = sqlx::query(sql)
            .bind(value)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentRepository for PgDocumentRepository {
    async fn get_document(&self, id: Uuid) -> Result<Document> {
        let query = format!("SELECT {DOCUMENT_COLUMNS} FROM document WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?
            .ok_or(Error::DocumentNotFound(id))?;
        Self::parse_document_row(row)
    }

    async fn get_chunks(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, content, chunk_index, page_number, sheet_name, chunk_type
             FROM document_chunk WHERE document_id = $1
             ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.into_iter().map(Self::parse_chunk_row).collect()
    }

    async fn update_status(&self, id: Uuid, status: DocumentStatus) -> Result<()> {
        self.touch(
            id,
            "UPDATE document SET status = $1, updated_at = $2 WHERE id = $3",
            Some(status.as_str()),
        )
        .await
    }

    async fn clear_error(&self, id: Uuid) -> Result<()> {
        self.touch(
            id,
            "UPDATE document SET error_message = $1, updated_at = $2 WHERE id = $3",
            None,
        )
        .await
    }

    async fn set_error(&self, id: Uuid, message: &str) -> Result<()> {
        self.touch(
            id,
            "UPDATE document SET status = 'error', error_message = $1, updated_at = $2 WHERE id = $3",
            Some(message),
        )
        .await
    }

    async fn set_summary(&self, id: Uuid, summary: &str) -> Result<()> {
        self.touch(
            id,
            "UPDATE document SET summary = $1, updated_at = $2 WHERE id = $3",
            Some(summary),
        )
        .await
    }

    async fn list_for_deal(&self, namespace: &Namespace) -> Result<Vec<Document>> {
        let query = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM document
             WHERE organization_id = $1 AND deal_id = $2
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&query)
            .bind(namespace.organization_id())
            .bind(namespace.deal_id())
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.into_iter().map(Self::parse_document_row).collect()
    }

    async fn embedded_chunk_ids(&self, document_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM document_chunk
             WHERE document_id = $1 AND embedding IS NOT NULL
             ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(ids)
    }

    async fn store_chunk_embedding(&self, chunk_id: Uuid, vector: &Vector, model: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE document_chunk SET embedding = $1, embedding_model = $2 WHERE id = $3",
        )
        .bind(vector)
        .bind(model)
        .bind(chunk_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("chunk {}", chunk_id)));
        }
        Ok(())
    }
}

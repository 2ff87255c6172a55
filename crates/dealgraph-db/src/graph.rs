//! Namespaced knowledge graph on PostgreSQL + pgvector.
//!
//! Every row carries the namespace string and every statement filters on it.
//! Entities merge on `(namespace, normalized name)`, episodes on
//! `(namespace, name)` and edges on their full identity, so replaying an
//! episode converges on the same graph.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use dealgraph_core::{
    normalize_entity_name, EpisodeWrite, Error, GraphHit, GraphQuery, GraphSchema, GraphStore,
    Namespace, Result,
};

use crate::escape_like;

/// Reject writes that do not line up with the schema or their embeddings.
pub(crate) fn validate_write(write: &EpisodeWrite, schema: &GraphSchema) -> Result<()> {
    let extraction = &write.extraction;
    if write.entity_embeddings.len() != extraction.entities.len() {
        return Err(Error::InvalidInput(format!(
            "episode {} has {} entities but {} entity embeddings",
            write.episode.name,
            extraction.entities.len(),
            write.entity_embeddings.len()
        )));
    }
    if write.fact_embeddings.len() != extraction.relationships.len() {
        return Err(Error::InvalidInput(format!(
            "episode {} has {} relationships but {} fact embeddings",
            write.episode.name,
            extraction.relationships.len(),
            write.fact_embeddings.len()
        )));
    }
    if let Some(e) = extraction
        .entities
        .iter()
        .find(|e| !schema.allows_entity(&e.entity_type))
    {
        return Err(Error::InvalidInput(format!(
            "entity type {} is not in the graph schema",
            e.entity_type
        )));
    }
    if let Some(r) = extraction
        .relationships
        .iter()
        .find(|r| !schema.allows_edge(&r.relation_type))
    {
        return Err(Error::InvalidInput(format!(
            "edge type {} is not in the graph schema",
            r.relation_type
        )));
    }
    Ok(())
}

/// Connectivity failures become `GraphConnection` so the stage is retried.
fn graph_err(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            Error::GraphConnection(e.to_string())
        }
        other => Error::Database(other),
    }
}

pub struct PgGraphStore {
    pool: Pool<Postgres>,
}

impl PgGraphStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_hit(row: sqlx::postgres::PgRow) -> Result<GraphHit> {
        Ok(GraphHit {
            entity_name: row.try_get("name")?,
            entity_type: row.try_get("entity_type")?,
            summary: row.try_get("summary")?,
            facts: row.try_get("facts")?,
            episode_names: row.try_get("episodes")?,
            score: row.try_get("score")?,
        })
    }
}

const HIT_PROJECTION: &str = "e.name, e.entity_type, e.summary,
     ARRAY(SELECT g.fact FROM graph_edge g
           WHERE g.namespace = e.namespace
             AND (g.source_key = e.entity_key OR g.target_key = e.entity_key)
           ORDER BY g.fact) AS facts,
     ARRAY(SELECT ep.episode_name FROM graph_entity_episode ep
           WHERE ep.namespace = e.namespace AND ep.entity_key = e.entity_key
           ORDER BY ep.episode_name) AS episodes";

#[async_trait]
impl GraphStore for PgGraphStore {
    async fn add_episode(&self, write: &EpisodeWrite, schema: &GraphSchema) -> Result<()> {
        validate_write(write, schema)?;
        let namespace = write.episode.namespace.to_string();
        let episode = &write.episode;

        let mut tx = self.pool.begin().await.map_err(graph_err)?;

        sqlx::query(
            "INSERT INTO graph_episode (namespace, name, content, source_description)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (namespace, name) DO UPDATE SET
                 content = EXCLUDED.content,
                 source_description = EXCLUDED.source_description,
                 updated_at = NOW()",
        )
        .bind(&namespace)
        .bind(&episode.name)
        .bind(&episode.content)
        .bind(&episode.source_description)
        .execute(&mut *tx)
        .await
        .map_err(graph_err)?;

        for (entity, embedding) in write
            .extraction
            .entities
            .iter()
            .zip(&write.entity_embeddings)
        {
            let key = normalize_entity_name(&entity.name);
            sqlx::query(
                "INSERT INTO graph_entity (namespace, entity_key, name, entity_type, summary, embedding)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (namespace, entity_key) DO UPDATE SET
                     summary = CASE WHEN EXCLUDED.summary <> '' THEN EXCLUDED.summary
                                    ELSE graph_entity.summary END,
                     embedding = EXCLUDED.embedding,
                     updated_at = NOW()",
            )
            .bind(&namespace)
            .bind(&key)
            .bind(&entity.name)
            .bind(&entity.entity_type)
            .bind(&entity.summary)
            .bind(embedding)
            .execute(&mut *tx)
            .await
            .map_err(graph_err)?;

            sqlx::query(
                "INSERT INTO graph_entity_episode (namespace, entity_key, episode_name)
                 VALUES ($1, $2, $3)
                 ON CONFLICT DO NOTHING",
            )
            .bind(&namespace)
            .bind(&key)
            .bind(&episode.name)
            .execute(&mut *tx)
            .await
            .map_err(graph_err)?;
        }

        for (rel, embedding) in write
            .extraction
            .relationships
            .iter()
            .zip(&write.fact_embeddings)
        {
            sqlx::query(
                "INSERT INTO graph_edge
                     (namespace, source_key, target_key, relation_type, fact, episode_name, embedding)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (namespace, source_key, target_key, relation_type, fact) DO UPDATE SET
                     episode_name = EXCLUDED.episode_name,
                     embedding = EXCLUDED.embedding,
                     updated_at = NOW()",
            )
            .bind(&namespace)
            .bind(normalize_entity_name(&rel.source))
            .bind(normalize_entity_name(&rel.target))
            .bind(&rel.relation_type)
            .bind(&rel.fact)
            .bind(&episode.name)
            .bind(embedding)
            .execute(&mut *tx)
            .await
            .map_err(graph_err)?;
        }

        tx.commit().await.map_err(graph_err)?;

        debug!(
            subsystem = "database",
            component = "graph_store",
            op = "add_episode",
            namespace = %namespace,
            episode = %episode.name,
            entities = write.extraction.entities.len(),
            relationships = write.extraction.relationships.len(),
            "Episode merged"
        );
        Ok(())
    }

    async fn search(&self, namespace: &Namespace, query: &GraphQuery) -> Result<Vec<GraphHit>> {
        let ns = namespace.to_string();
        let limit = query.limit.max(1) as i64;

        let rows = match &query.vector {
            Some(vector) => {
                let sql = format!(
                    "SELECT {HIT_PROJECTION}, (1 - (e.embedding <=> $2))::real AS score
                     FROM graph_entity e
                     WHERE e.namespace = $1 AND e.embedding IS NOT NULL
                     ORDER BY e.embedding <=> $2
                     LIMIT $3"
                );
                sqlx::query(&sql)
                    .bind(&ns)
                    .bind(vector)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let pattern = format!("%{}%", escape_like(query.text.trim()));
                let sql = format!(
                    "SELECT {HIT_PROJECTION}, 1.0::real AS score
                     FROM graph_entity e
                     WHERE e.namespace = $1
                       AND (e.name ILIKE $2 OR e.summary ILIKE $2)
                     ORDER BY e.name
                     LIMIT $3"
                );
                sqlx::query(&sql)
                    .bind(&ns)
                    .bind(pattern)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(graph_err)?;

        rows.into_iter().map(Self::parse_hit).collect()
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(graph_err)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealgraph_core::{Episode, ExtractedEntity, ExtractedRelationship, Extraction, Vector};

    fn write(entity_type: &str, edge: &str, entity_vectors: usize) -> EpisodeWrite {
        EpisodeWrite {
            episode: Episode {
                name: "a.pdf#chunk-0".into(),
                content: "x".into(),
                source_description: "document 'a.pdf'".into(),
                namespace: Namespace::new("o", "d").unwrap(),
            },
            extraction: Extraction {
                entities: vec![
                    ExtractedEntity {
                        name: "Acme".into(),
                        entity_type: entity_type.into(),
                        summary: String::new(),
                    },
                    ExtractedEntity {
                        name: "Beta".into(),
                        entity_type: "Company".into(),
                        summary: String::new(),
                    },
                ],
                relationships: vec![ExtractedRelationship {
                    source: "Acme".into(),
                    target: "Beta".into(),
                    relation_type: edge.into(),
                    fact: "Acme owns Beta".into(),
                }],
            },
            entity_embeddings: vec![Vector::from(vec![1.0]); entity_vectors],
            fact_embeddings: vec![Vector::from(vec![1.0])],
        }
    }

    #[test]
    fn test_validate_accepts_schema_types() {
        let schema = GraphSchema::due_diligence();
        assert!(validate_write(&write("Company", "OWNS", 2), &schema).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_types() {
        let schema = GraphSchema::due_diligence();
        assert!(matches!(
            validate_write(&write("Planet", "OWNS", 2), &schema),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            validate_write(&write("Company", "ORBITS", 2), &schema),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_validate_rejects_misaligned_embeddings() {
        let schema = GraphSchema::due_diligence();
        assert!(matches!(
            validate_write(&write("Company", "OWNS", 1), &schema),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_pool_errors_are_graph_connection() {
        assert!(matches!(
            graph_err(sqlx::Error::PoolTimedOut),
            Error::GraphConnection(_)
        ));
        assert!(matches!(
            graph_err(sqlx::Error::RowNotFound),
            Error::Database(_)
        ));
    }
}

//! In-memory implementations of every repository trait.
//!
//! Used by tests in downstream crates (`memory` feature). Behaviour mirrors
//! the PostgreSQL implementations: enqueue deduplicates live jobs, claims
//! honour `run_after`, and the graph merges on the same keys.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use uuid::Uuid;

use dealgraph_core::{
    defaults, new_v7, normalize_entity_name, Chunk, Document, DocumentRepository, DocumentStatus,
    Episode, EpisodeWrite, Error, GraphHit, GraphQuery, GraphSchema, GraphStore, Job,
    JobRepository, JobStatus, Namespace, PipelineStage, Result, StageRepository, StageState,
    UsageRecord, UsageRepository, Vector,
};

use crate::graph::validate_write;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// JOBS
// =============================================================================

pub struct MemoryJobRepository {
    jobs: Mutex<Vec<Job>>,
    max_retries: i32,
    notify: Arc<Notify>,
}

impl Default for MemoryJobRepository {
    fn default() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            max_retries: defaults::JOB_MAX_RETRIES,
            notify: Arc::new(Notify::new()),
        }
    }
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Signalled on every new job, like [`crate::PgJobRepository::job_notify`].
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Snapshot of every job ever enqueued, in insertion order.
    pub fn jobs(&self) -> Vec<Job> {
        lock(&self.jobs).clone()
    }

    pub fn jobs_for(&self, document_id: Uuid) -> Vec<Job> {
        lock(&self.jobs)
            .iter()
            .filter(|j| j.document_id == Some(document_id))
            .cloned()
            .collect()
    }

    fn update<F: FnOnce(&mut Job)>(&self, job_id: Uuid, f: F) -> Result<()> {
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
        f(job);
        Ok(())
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn enqueue(
        &self,
        stage: PipelineStage,
        document_id: Option<Uuid>,
        payload: JsonValue,
    ) -> Result<Uuid> {
        let mut jobs = lock(&self.jobs);
        if document_id.is_some() {
            if let Some(live) = jobs.iter().find(|j| {
                j.document_id == document_id
                    && j.stage == stage
                    && matches!(j.status, JobStatus::Pending | JobStatus::Running)
            }) {
                return Ok(live.id);
            }
        }
        let now = Utc::now();
        let job = Job {
            id: new_v7(),
            document_id,
            stage,
            status: JobStatus::Pending,
            payload,
            retry_count: 0,
            max_retries: self.max_retries,
            error_message: None,
            run_after: now,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        let id = job.id;
        jobs.push(job);
        self.notify.notify_one();
        Ok(id)
    }

    async fn claim_next(&self, stages: &[PipelineStage]) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = lock(&self.jobs);
        let next = jobs
            .iter_mut()
            .filter(|j| {
                j.status == JobStatus::Pending
                    && j.run_after <= now
                    && (stages.is_empty() || stages.contains(&j.stage))
            })
            .min_by_key(|j| (j.run_after, j.created_at));
        Ok(next.map(|job| {
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.clone()
        }))
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        self.update(job_id, |job| {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            job.error_message = None;
        })
    }

    async fn retry_later(&self, job_id: Uuid, error: &str, delay: Duration) -> Result<()> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| Error::InvalidInput(format!("retry delay out of range: {}", e)))?;
        self.update(job_id, |job| {
            job.status = JobStatus::Pending;
            job.retry_count += 1;
            job.error_message = Some(error.to_string());
            job.run_after = Utc::now() + delay;
            job.started_at = None;
        })
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        self.update(job_id, |job| {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error_message = Some(error.to_string());
        })
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(lock(&self.jobs).iter().find(|j| j.id == job_id).cloned())
    }

    async fn pending_count(&self) -> Result<i64> {
        Ok(lock(&self.jobs)
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .count() as i64)
    }
}

// =============================================================================
// DOCUMENTS
// =============================================================================

#[derive(Default)]
pub struct MemoryDocumentRepository {
    documents: Mutex<HashMap<Uuid, Document>>,
    chunks: Mutex<HashMap<Uuid, Vec<Chunk>>>,
    embeddings: Mutex<HashMap<Uuid, (Vector, String)>>,
}

impl MemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_document(&self, document: Document) {
        lock(&self.documents).insert(document.id, document);
    }

    /// Store chunks for a document, replacing any previous set.
    pub fn insert_chunks(&self, document_id: Uuid, chunks: Vec<Chunk>) {
        lock(&self.chunks).insert(document_id, chunks);
    }

    pub fn document(&self, id: Uuid) -> Option<Document> {
        lock(&self.documents).get(&id).cloned()
    }

    pub fn embedding_for(&self, chunk_id: Uuid) -> Option<(Vector, String)> {
        lock(&self.embeddings).get(&chunk_id).cloned()
    }

    fn with_document<F: FnOnce(&mut Document)>(&self, id: Uuid, f: F) -> Result<()> {
        let mut documents = lock(&self.documents);
        let doc = documents.get_mut(&id).ok_or(Error::DocumentNotFound(id))?;
        f(doc);
        Ok(())
    }
}

#[async_trait]
impl DocumentRepository for MemoryDocumentRepository {
    async fn get_document(&self, id: Uuid) -> Result<Document> {
        self.document(id).ok_or(Error::DocumentNotFound(id))
    }

    async fn get_chunks(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let mut chunks = lock(&self.chunks)
            .get(&document_id)
            .cloned()
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn update_status(&self, id: Uuid, status: DocumentStatus) -> Result<()> {
        self.with_document(id, |d| d.status = status)
    }

    async fn clear_error(&self, id: Uuid) -> Result<()> {
        self.with_document(id, |d| d.error_message = None)
    }

    async fn set_error(&self, id: Uuid, message: &str) -> Result<()> {
        self.with_document(id, |d| {
            d.status = DocumentStatus::Error;
            d.error_message = Some(message.to_string());
        })
    }

    async fn set_summary(&self, id: Uuid, summary: &str) -> Result<()> {
        self.with_document(id, |d| d.summary = Some(summary.to_string()))
    }

    async fn list_for_deal(&self, namespace: &Namespace) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = lock(&self.documents)
            .values()
            .filter(|d| {
                d.organization_id == namespace.organization_id()
                    && d.deal_id == namespace.deal_id()
            })
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.created_at);
        Ok(docs)
    }

    async fn embedded_chunk_ids(&self, document_id: Uuid) -> Result<Vec<Uuid>> {
        let embeddings = lock(&self.embeddings);
        Ok(lock(&self.chunks)
            .get(&document_id)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|c| embeddings.contains_key(&c.id))
                    .map(|c| c.id)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn store_chunk_embedding(&self, chunk_id: Uuid, vector: &Vector, model: &str) -> Result<()> {
        lock(&self.embeddings).insert(chunk_id, (vector.clone(), model.to_string()));
        Ok(())
    }
}

// =============================================================================
// STAGE STATE
// =============================================================================

#[derive(Default)]
pub struct MemoryStageRepository {
    states: Mutex<HashMap<Uuid, StageState>>,
}

impl MemoryStageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, document_id: Uuid) -> Option<StageState> {
        lock(&self.states).get(&document_id).cloned()
    }
}

#[async_trait]
impl StageRepository for MemoryStageRepository {
    async fn get(&self, document_id: Uuid) -> Result<Option<StageState>> {
        Ok(self.state(document_id))
    }

    async fn upsert(&self, state: &StageState) -> Result<()> {
        lock(&self.states).insert(state.document_id, state.clone());
        Ok(())
    }
}

// =============================================================================
// USAGE
// =============================================================================

#[derive(Default)]
pub struct MemoryUsageRepository {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        lock(&self.records).clone()
    }

    pub fn records_for_feature(&self, feature: &str) -> Vec<UsageRecord> {
        lock(&self.records)
            .iter()
            .filter(|r| r.feature == feature)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl UsageRepository for MemoryUsageRepository {
    async fn insert_usage_record(&self, record: &UsageRecord) -> Result<Uuid> {
        lock(&self.records).push(record.clone());
        Ok(new_v7())
    }
}

// =============================================================================
// GRAPH
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntity {
    pub name: String,
    pub entity_type: String,
    pub summary: String,
    pub embedding: Vector,
    pub episodes: BTreeSet<String>,
}

type EdgeKey = (String, String, String, String);

#[derive(Default)]
struct NamespaceGraph {
    episodes: BTreeMap<String, Episode>,
    entities: BTreeMap<String, MemoryEntity>,
    edges: BTreeSet<EdgeKey>,
}

#[derive(Default)]
pub struct MemoryGraphStore {
    graphs: Mutex<HashMap<String, NamespaceGraph>>,
    write_count: AtomicUsize,
    failures_remaining: AtomicUsize,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes with `GraphConnection`.
    pub fn fail_next_writes(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Number of successful `add_episode` calls.
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    pub fn episode_names(&self, namespace: &Namespace) -> Vec<String> {
        lock(&self.graphs)
            .get(&namespace.to_string())
            .map(|g| g.episodes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Normalized entity keys in a namespace.
    pub fn entity_keys(&self, namespace: &Namespace) -> BTreeSet<String> {
        lock(&self.graphs)
            .get(&namespace.to_string())
            .map(|g| g.entities.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entity(&self, namespace: &Namespace, name: &str) -> Option<MemoryEntity> {
        lock(&self.graphs)
            .get(&namespace.to_string())
            .and_then(|g| g.entities.get(&normalize_entity_name(name)).cloned())
    }

    pub fn edge_count(&self, namespace: &Namespace) -> usize {
        lock(&self.graphs)
            .get(&namespace.to_string())
            .map(|g| g.edges.len())
            .unwrap_or(0)
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn add_episode(&self, write: &EpisodeWrite, schema: &GraphSchema) -> Result<()> {
        if self.take_failure() {
            return Err(Error::GraphConnection("injected graph outage".into()));
        }
        validate_write(write, schema)?;

        let mut graphs = lock(&self.graphs);
        let graph = graphs
            .entry(write.episode.namespace.to_string())
            .or_default();
        let episode_name = write.episode.name.clone();
        graph
            .episodes
            .insert(episode_name.clone(), write.episode.clone());

        for (entity, embedding) in write
            .extraction
            .entities
            .iter()
            .zip(&write.entity_embeddings)
        {
            let stored = graph
                .entities
                .entry(normalize_entity_name(&entity.name))
                .or_insert_with(|| MemoryEntity {
                    name: entity.name.clone(),
                    entity_type: entity.entity_type.clone(),
                    summary: String::new(),
                    embedding: embedding.clone(),
                    episodes: BTreeSet::new(),
                });
            if !entity.summary.is_empty() {
                stored.summary = entity.summary.clone();
            }
            stored.embedding = embedding.clone();
            stored.episodes.insert(episode_name.clone());
        }

        for rel in &write.extraction.relationships {
            graph.edges.insert((
                normalize_entity_name(&rel.source),
                normalize_entity_name(&rel.target),
                rel.relation_type.clone(),
                rel.fact.clone(),
            ));
        }

        self.write_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn search(&self, namespace: &Namespace, query: &GraphQuery) -> Result<Vec<GraphHit>> {
        let graphs = lock(&self.graphs);
        let Some(graph) = graphs.get(&namespace.to_string()) else {
            return Ok(Vec::new());
        };

        let needle = query.text.trim().to_lowercase();
        let mut hits: Vec<GraphHit> = graph
            .entities
            .iter()
            .filter_map(|(key, entity)| {
                let score = match &query.vector {
                    Some(v) => cosine(v.as_slice(), entity.embedding.as_slice()),
                    None if needle.is_empty()
                        || key.contains(&needle)
                        || entity.summary.to_lowercase().contains(&needle) =>
                    {
                        1.0
                    }
                    None => return None,
                };
                let facts = graph
                    .edges
                    .iter()
                    .filter(|(s, t, _, _)| s == key || t == key)
                    .map(|(_, _, _, fact)| fact.clone())
                    .collect();
                Some(GraphHit {
                    entity_name: entity.name.clone(),
                    entity_type: entity.entity_type.clone(),
                    summary: entity.summary.clone(),
                    facts,
                    episode_names: entity.episodes.iter().cloned().collect(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entity_name.cmp(&b.entity_name))
        });
        hits.truncate(query.limit.max(1));
        Ok(hits)
    }
}

//! Data model shared by every dealgraph crate.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};

pub use pgvector::Vector;

// =============================================================================
// PROVIDERS AND MODEL IDENTIFIERS
// =============================================================================

/// The closed set of model providers the resolver knows how to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    Google,
    Voyage,
    Ollama,
}

impl Provider {
    /// Every supported provider, in display order.
    pub const ALL: [Provider; 5] = [
        Provider::Anthropic,
        Provider::OpenAI,
        Provider::Google,
        Provider::Voyage,
        Provider::Ollama,
    ];

    /// Prefix used in `provider:model` identifiers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAI => "openai",
            Self::Google => "google",
            Self::Voyage => "voyage",
            Self::Ollama => "ollama",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::Configuration(format!("Unknown provider: '{}'", s)))
    }
}

/// A parsed `provider:model` identifier such as `anthropic:claude-sonnet-4-0`.
///
/// Only the first colon separates the provider; the model part may contain
/// further colons (`ollama:qwen3:8b`) or slashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelId {
    provider: Provider,
    model: String,
}

impl ModelId {
    /// Parse a `provider:model` string. Fails with `Configuration` on malformed input.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (provider, model) = s.split_once(':').ok_or_else(|| {
            Error::Configuration(format!(
                "Model id '{}' must have the form provider:model",
                s
            ))
        })?;
        if provider.is_empty() {
            return Err(Error::Configuration(format!(
                "Model id '{}' has an empty provider",
                s
            )));
        }
        if model.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "Model id '{}' has an empty model name",
                s
            )));
        }
        Ok(Self {
            provider: provider.trim().parse()?,
            model: model.trim().to_string(),
        })
    }

    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

impl FromStr for ModelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ModelId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ModelId> for String {
    fn from(id: ModelId) -> Self {
        id.to_string()
    }
}

/// Per-agent sampling settings applied by the resolver to every call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    crate::defaults::MODEL_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    crate::defaults::MODEL_MAX_TOKENS
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Agents that consume models. Each has its own primary/fallback pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Entity/relationship extraction during graph ingestion
    GraphExtraction,
    /// Chunk and entity embeddings
    Embedding,
    /// Per-document summary in the analyze stage
    DocumentAnalysis,
    /// Specialist query answering over the graph
    Specialist,
}

impl AgentType {
    pub const ALL: [AgentType; 4] = [
        AgentType::GraphExtraction,
        AgentType::Embedding,
        AgentType::DocumentAnalysis,
        AgentType::Specialist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GraphExtraction => "graph_extraction",
            Self::Embedding => "embedding",
            Self::DocumentAnalysis => "document_analysis",
            Self::Specialist => "specialist",
        }
    }

    /// Environment variable that overrides this agent's primary model id.
    pub fn env_override_key(&self) -> String {
        format!("DEALGRAPH_{}_MODEL", self.as_str().to_uppercase())
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved model configuration for one agent. Immutable after load.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub agent_type: AgentType,
    pub primary_model_id: ModelId,
    pub fallback_model_id: Option<ModelId>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ModelConfig {
    pub fn settings(&self) -> ModelSettings {
        ModelSettings {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

// =============================================================================
// PRICING AND USAGE
// =============================================================================

/// Per-million-token USD rates for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    /// Cost in USD for the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 * self.input_per_million / 1e6
            + output_tokens as f64 * self.output_per_million / 1e6
    }

    /// Input rate per single token.
    pub fn input_per_token(&self) -> f64 {
        self.input_per_million / 1e6
    }
}

/// Mapping from `provider:model` to its rates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable(HashMap<String, ModelPricing>);

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model_id: &ModelId, pricing: ModelPricing) {
        self.0.insert(model_id.to_string(), pricing);
    }

    pub fn with(mut self, model_id: &ModelId, pricing: ModelPricing) -> Self {
        self.insert(model_id, pricing);
        self
    }

    pub fn get(&self, model_id: &ModelId) -> Option<&ModelPricing> {
        self.0.get(&model_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Re-key every entry by its parsed [`ModelId`] so lookups match ids
    /// however the file spelled them.
    ///
    /// Keys that do not parse, or two keys naming the same model, are a
    /// `Configuration` error.
    pub fn normalized(self) -> Result<Self> {
        let mut invalid = Vec::new();
        let mut table = HashMap::with_capacity(self.0.len());
        for (key, pricing) in self.0 {
            match ModelId::parse(&key) {
                Ok(id) => {
                    if table.insert(id.to_string(), pricing).is_some() {
                        return Err(Error::Configuration(format!(
                            "Duplicate pricing entry for {}",
                            id
                        )));
                    }
                }
                Err(_) => invalid.push(key),
            }
        }
        if !invalid.is_empty() {
            invalid.sort();
            return Err(Error::Configuration(format!(
                "Invalid pricing keys: {}",
                invalid.join(", ")
            )));
        }
        Ok(Self(table))
    }
}

/// Token and latency metrics reported by one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
}

/// Tenant attribution attached to a usage record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageContext {
    pub organization_id: Option<String>,
    pub deal_id: Option<String>,
    pub user_id: Option<String>,
}

impl UsageContext {
    pub fn for_namespace(namespace: &Namespace) -> Self {
        Self {
            organization_id: Some(namespace.organization_id().to_string()),
            deal_id: Some(namespace.deal_id().to_string()),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Append-only record of one LLM/embedding call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub feature: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
    pub organization_id: Option<String>,
    pub deal_id: Option<String>,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Emitted (logged, not persisted) whenever a fallback chain switches providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEvent {
    pub primary_model_id: String,
    pub fallback_model_id: String,
    pub triggering_error: String,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// MODEL CALL PAYLOADS
// =============================================================================

/// Provider-agnostic prompt. Sampling settings come from the model handle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
    /// Ask the provider for a JSON object response where supported.
    pub json_output: bool,
}

impl Prompt {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            system: None,
            user: user.into(),
            json_output: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn json(mut self) -> Self {
        self.json_output = true;
        self
    }
}

/// Text completion plus its usage metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: UsageMetrics,
}

/// Embedding vectors (one per input text) plus usage metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
    pub vectors: Vec<Vector>,
    pub usage: UsageMetrics,
}

// =============================================================================
// TENANCY
// =============================================================================

/// Tenant + deal isolation key, rendered `{organization_id}:{deal_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    organization_id: String,
    deal_id: String,
}

impl Namespace {
    pub fn new(organization_id: impl Into<String>, deal_id: impl Into<String>) -> Result<Self> {
        let organization_id = organization_id.into();
        let deal_id = deal_id.into();
        for (label, part) in [("organization id", &organization_id), ("deal id", &deal_id)] {
            if part.trim().is_empty() {
                return Err(Error::InvalidInput(format!("Namespace {} is empty", label)));
            }
            if part.contains(':') {
                return Err(Error::InvalidInput(format!(
                    "Namespace {} '{}' must not contain ':'",
                    label, part
                )));
            }
        }
        Ok(Self {
            organization_id,
            deal_id,
        })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (org, deal) = s.split_once(':').ok_or_else(|| {
            Error::InvalidInput(format!("Namespace '{}' must be organization:deal", s))
        })?;
        Self::new(org, deal)
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn deal_id(&self) -> &str {
        &self.deal_id
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.organization_id, self.deal_id)
    }
}

impl TryFrom<String> for Namespace {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}

// =============================================================================
// DOCUMENTS AND CHUNKS
// =============================================================================

/// Structural kind of a chunk, as produced by the upstream parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    #[default]
    Text,
    Table,
    Heading,
    List,
    ImageCaption,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Table => "table",
            Self::Heading => "heading",
            Self::List => "list",
            Self::ImageCaption => "image_caption",
        }
    }
}

impl FromStr for ChunkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(Self::Text),
            "table" => Ok(Self::Table),
            "heading" => Ok(Self::Heading),
            "list" => Ok(Self::List),
            "image_caption" => Ok(Self::ImageCaption),
            _ => Err(Error::InvalidInput(format!("Unknown chunk type: {}", s))),
        }
    }
}

/// A unit of parsed document content. Read-only to this pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub content: String,
    pub chunk_index: i32,
    pub page_number: Option<i32>,
    pub sheet_name: Option<String>,
    pub chunk_type: ChunkType,
}

/// Coarse document status surfaced to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Parsing,
    Embedding,
    GraphIngesting,
    Analyzing,
    Ready,
    Error,
}

impl DocumentStatus {
    /// Status shown while `stage` is processing.
    pub fn for_stage(stage: PipelineStage) -> Self {
        match stage {
            PipelineStage::Parse => Self::Parsing,
            PipelineStage::Embed => Self::Embedding,
            PipelineStage::GraphIngest => Self::GraphIngesting,
            PipelineStage::Analyze => Self::Analyzing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Parsing => "parsing",
            Self::Embedding => "embedding",
            Self::GraphIngesting => "graph_ingesting",
            Self::Analyzing => "analyzing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uploaded" => Ok(Self::Uploaded),
            "parsing" => Ok(Self::Parsing),
            "embedding" => Ok(Self::Embedding),
            "graph_ingesting" => Ok(Self::GraphIngesting),
            "analyzing" => Ok(Self::Analyzing),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            _ => Err(Error::InvalidInput(format!("Unknown document status: {}", s))),
        }
    }
}

/// A deal document as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub organization_id: String,
    pub deal_id: String,
    pub name: String,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn namespace(&self) -> Result<Namespace> {
        Namespace::new(self.organization_id.clone(), self.deal_id.clone())
    }
}

// =============================================================================
// GRAPH
// =============================================================================

/// One unit of graph ingestion, derived 1:1 from a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub name: String,
    pub content: String,
    pub source_description: String,
    pub namespace: Namespace,
}

/// Entity and edge types the extraction model is constrained to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSchema {
    pub entity_types: Vec<String>,
    pub edge_types: Vec<String>,
}

impl GraphSchema {
    /// Types used for deal due diligence.
    pub fn due_diligence() -> Self {
        let entity_types = [
            "Company",
            "Person",
            "FinancialMetric",
            "Contract",
            "Asset",
            "Risk",
            "Regulation",
            "Product",
            "Location",
        ];
        let edge_types = [
            "OWNS",
            "EMPLOYS",
            "PARTY_TO",
            "REPORTS",
            "SUBSIDIARY_OF",
            "EXPOSED_TO",
            "GOVERNED_BY",
            "SUPPLIES",
            "LOCATED_IN",
            "RELATED_TO",
        ];
        Self {
            entity_types: entity_types.iter().map(|s| s.to_string()).collect(),
            edge_types: edge_types.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn allows_entity(&self, entity_type: &str) -> bool {
        self.entity_types.iter().any(|t| t == entity_type)
    }

    pub fn allows_edge(&self, edge_type: &str) -> bool {
        self.edge_types.iter().any(|t| t == edge_type)
    }
}

impl Default for GraphSchema {
    fn default() -> Self {
        Self::due_diligence()
    }
}

/// Merge key for entities within a namespace: trimmed, lowercased, inner
/// whitespace collapsed.
pub fn normalize_entity_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    pub relation_type: String,
    #[serde(default)]
    pub fact: String,
}

/// Entities and relationships extracted from one episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
}

/// Everything the graph store needs to merge one episode.
///
/// `entity_embeddings[i]` belongs to `extraction.entities[i]` and
/// `fact_embeddings[j]` to `extraction.relationships[j]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeWrite {
    pub episode: Episode,
    pub extraction: Extraction,
    pub entity_embeddings: Vec<Vector>,
    pub fact_embeddings: Vec<Vector>,
}

/// Namespace-scoped graph query.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQuery {
    pub text: String,
    pub vector: Option<Vector>,
    pub limit: usize,
}

/// An entity returned from graph search with its connected facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphHit {
    pub entity_name: String,
    pub entity_type: String,
    pub summary: String,
    pub facts: Vec<String>,
    pub episode_names: Vec<String>,
    pub score: f32,
}

/// Returned by one document ingestion call. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IngestionResult {
    pub episode_count: usize,
    pub elapsed_ms: u64,
    pub estimated_cost_usd: f64,
}

// =============================================================================
// PIPELINE STAGES
// =============================================================================

/// Fixed, ordered pipeline stages. Job types map 1:1 onto stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Parse,
    Embed,
    GraphIngest,
    Analyze,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 4] = [
        PipelineStage::Parse,
        PipelineStage::Embed,
        PipelineStage::GraphIngest,
        PipelineStage::Analyze,
    ];

    pub fn first() -> Self {
        Self::Parse
    }

    /// Follow-on stage, `None` after the last stage.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Parse => Some(Self::Embed),
            Self::Embed => Some(Self::GraphIngest),
            Self::GraphIngest => Some(Self::Analyze),
            Self::Analyze => None,
        }
    }

    pub fn previous(&self) -> Option<Self> {
        match self {
            Self::Parse => None,
            Self::Embed => Some(Self::Parse),
            Self::GraphIngest => Some(Self::Embed),
            Self::Analyze => Some(Self::GraphIngest),
        }
    }

    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Embed => "embed",
            Self::GraphIngest => "graph_ingest",
            Self::Analyze => "analyze",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "parse" => Ok(Self::Parse),
            "embed" => Ok(Self::Embed),
            "graph_ingest" => Ok(Self::GraphIngest),
            "analyze" => Ok(Self::Analyze),
            _ => Err(Error::InvalidInput(format!("Unknown pipeline stage: {}", s))),
        }
    }
}

/// Status of a document's current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageStatus {
    Queued,
    Processing,
    Completed,
    Failed { retryable: bool },
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    /// Rebuild from the stored `(status, retryable)` column pair.
    pub fn from_parts(status: &str, retryable: bool) -> Result<Self> {
        match status {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed { retryable }),
            _ => Err(Error::InvalidInput(format!("Unknown stage status: {}", status))),
        }
    }

    pub fn is_retryable_failure(&self) -> bool {
        matches!(self, Self::Failed { retryable: true })
    }
}

/// Per-document pipeline position. Mutated only by the stage manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub document_id: Uuid,
    pub current_stage: PipelineStage,
    pub status: StageStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StageState {
    /// State of a document that just entered the pipeline.
    pub fn new(document_id: Uuid) -> Self {
        Self {
            document_id,
            current_stage: PipelineStage::first(),
            status: StageStatus::Queued,
            retry_count: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether `stage` has already been completed by this document.
    pub fn has_completed(&self, stage: PipelineStage) -> bool {
        self.current_stage > stage
            || (self.current_stage == stage && self.status == StageStatus::Completed)
    }

    /// Whether the whole pipeline is done.
    pub fn is_finished(&self) -> bool {
        self.current_stage.is_last() && self.status == StageStatus::Completed
    }
}

// =============================================================================
// JOBS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(Error::InvalidInput(format!("Unknown job status: {}", s))),
        }
    }
}

/// A queued stage job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub document_id: Option<Uuid>,
    pub stage: PipelineStage,
    pub status: JobStatus,
    pub payload: JsonValue,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Payload carried by every stage job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePayload {
    pub document_id: Uuid,
    pub organization_id: String,
    pub deal_id: String,
}

impl StagePayload {
    pub fn new(document_id: Uuid, namespace: &Namespace) -> Self {
        Self {
            document_id,
            organization_id: namespace.organization_id().to_string(),
            deal_id: namespace.deal_id().to_string(),
        }
    }

    pub fn namespace(&self) -> Result<Namespace> {
        Namespace::new(self.organization_id.clone(), self.deal_id.clone())
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::json!({
            "document_id": self.document_id,
            "organization_id": self.organization_id,
            "deal_id": self.deal_id,
        })
    }

    pub fn from_json(value: &JsonValue) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidInput(format!("Malformed stage payload: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_parse_valid() {
        let id = ModelId::parse("anthropic:claude-sonnet-4-0").unwrap();
        assert_eq!(id.provider(), Provider::Anthropic);
        assert_eq!(id.model(), "claude-sonnet-4-0");
        assert_eq!(id.to_string(), "anthropic:claude-sonnet-4-0");
    }

    #[test]
    fn test_model_id_keeps_colons_in_model() {
        let id = ModelId::parse("ollama:qwen3:8b").unwrap();
        assert_eq!(id.provider(), Provider::Ollama);
        assert_eq!(id.model(), "qwen3:8b");
    }

    #[test]
    fn test_model_id_rejects_malformed() {
        for bad in ["", "claude", ":model", "anthropic:", "anthropic:  ", "cohere:embed"] {
            let err = ModelId::parse(bad).unwrap_err();
            assert!(
                matches!(err, Error::Configuration(_)),
                "{bad:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_model_id_serde_as_string() {
        let id = ModelId::new(Provider::Voyage, "voyage-finance-2");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"voyage:voyage-finance-2\"");
        let back: ModelId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<ModelId>("\"nope\"").is_err());
    }

    #[test]
    fn test_pricing_cost() {
        let pricing = ModelPricing {
            input_per_million: 0.075,
            output_per_million: 0.30,
        };
        assert!((pricing.cost(1_000_000, 1_000_000) - 0.375).abs() < 1e-6);
        assert_eq!(pricing.cost(0, 0), 0.0);
    }

    #[test]
    fn test_pricing_table_normalized_matches_trimmed_keys() {
        let raw = r#"{
            " google:gemini-2.0-flash": {"input_per_million": 0.1, "output_per_million": 0.4},
            "openai : gpt-4o ": {"input_per_million": 2.5, "output_per_million": 10.0}
        }"#;
        let table: PricingTable = serde_json::from_str(raw).unwrap();
        let table = table.normalized().unwrap();

        let flash = ModelId::new(Provider::Google, "gemini-2.0-flash");
        assert_eq!(table.get(&flash).unwrap().input_per_million, 0.1);
        let gpt = ModelId::new(Provider::OpenAI, "gpt-4o");
        assert_eq!(table.get(&gpt).unwrap().output_per_million, 10.0);

        let bad: PricingTable =
            serde_json::from_str(r#"{"bogus": {"input_per_million": 1.0, "output_per_million": 1.0}}"#)
                .unwrap();
        let err = bad.normalized().unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_pricing_table_lookup_by_model_id() {
        let id = ModelId::parse("google:gemini-2.0-flash").unwrap();
        let table = PricingTable::new().with(
            &id,
            ModelPricing {
                input_per_million: 0.1,
                output_per_million: 0.4,
            },
        );
        assert!(table.get(&id).is_some());
        assert!(table
            .get(&ModelId::parse("google:gemini-2.5-pro").unwrap())
            .is_none());
    }

    #[test]
    fn test_namespace_round_trip_and_validation() {
        let ns = Namespace::new("orgA", "deal1").unwrap();
        assert_eq!(ns.to_string(), "orgA:deal1");
        assert_eq!(Namespace::parse("orgA:deal1").unwrap(), ns);
        assert!(Namespace::new("", "deal1").is_err());
        assert!(Namespace::new("org:A", "deal1").is_err());
        assert!(Namespace::parse("orgA").is_err());
        assert!(Namespace::parse("a:b:c").is_err());
    }

    #[test]
    fn test_namespaces_for_different_deals_differ() {
        let a = Namespace::new("orgA", "deal1").unwrap();
        let b = Namespace::new("orgA", "deal2").unwrap();
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_pipeline_stage_order() {
        assert_eq!(PipelineStage::first(), PipelineStage::Parse);
        assert_eq!(PipelineStage::Parse.next(), Some(PipelineStage::Embed));
        assert_eq!(PipelineStage::Analyze.next(), None);
        assert_eq!(PipelineStage::Embed.previous(), Some(PipelineStage::Parse));
        assert!(PipelineStage::Parse < PipelineStage::Analyze);
        for stage in PipelineStage::ALL {
            assert_eq!(stage.as_str().parse::<PipelineStage>().unwrap(), stage);
        }
    }

    #[test]
    fn test_stage_state_has_completed() {
        let mut state = StageState::new(Uuid::new_v4());
        assert!(!state.has_completed(PipelineStage::Parse));

        state.status = StageStatus::Completed;
        assert!(state.has_completed(PipelineStage::Parse));
        assert!(!state.has_completed(PipelineStage::Embed));

        state.current_stage = PipelineStage::GraphIngest;
        state.status = StageStatus::Processing;
        assert!(state.has_completed(PipelineStage::Embed));
        assert!(!state.has_completed(PipelineStage::GraphIngest));
    }

    #[test]
    fn test_stage_status_parts() {
        assert_eq!(
            StageStatus::from_parts("failed", true).unwrap(),
            StageStatus::Failed { retryable: true }
        );
        assert_eq!(
            StageStatus::from_parts("queued", true).unwrap(),
            StageStatus::Queued
        );
        assert!(StageStatus::from_parts("bogus", false).is_err());
    }

    #[test]
    fn test_stage_payload_json() {
        let ns = Namespace::new("org", "deal").unwrap();
        let payload = StagePayload::new(Uuid::new_v4(), &ns);
        let back = StagePayload::from_json(&payload.to_json()).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.namespace().unwrap(), ns);
        assert!(StagePayload::from_json(&serde_json::json!({"document_id": 1})).is_err());
    }

    #[test]
    fn test_graph_schema_allows() {
        let schema = GraphSchema::due_diligence();
        assert!(schema.allows_entity("Company"));
        assert!(!schema.allows_entity("Planet"));
        assert!(schema.allows_edge("OWNS"));
    }

    #[test]
    fn test_normalize_entity_name() {
        assert_eq!(normalize_entity_name("  Acme   Corp "), "acme corp");
        assert_eq!(
            normalize_entity_name("ACME CORP"),
            normalize_entity_name("acme corp")
        );
    }

    #[test]
    fn test_agent_env_override_key() {
        assert_eq!(
            AgentType::GraphExtraction.env_override_key(),
            "DEALGRAPH_GRAPH_EXTRACTION_MODEL"
        );
    }
}

//! Specialist query: answer a question from a deal's knowledge graph.
//!
//! Documents in scope that have not finished ingestion are queued and listed
//! in `pendingDocuments`; the answer only reflects what is already indexed.
//!
//! Graph episodes are keyed by document name within a deal, so a
//! `documentIds` scope is applied through names. A requested document whose
//! name is shared with an unrequested document of the same deal cannot be
//! separated from it and the query is rejected with 409.

use std::collections::HashSet;
use std::time::Instant;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use dealgraph_core::{
    defaults, Document, DocumentStatus, GraphHit, GraphQuery, Namespace, Prompt, UsageContext,
};
use dealgraph_graph::json_object_slice;

use crate::auth::Tenant;
use crate::error::ApiError;
use crate::state::AppState;

const SPECIALIST_SYSTEM_PROMPT: &str = "You are a due diligence specialist. Answer the \
question using only the knowledge graph context provided. Reply with a JSON object of the form \
{\"findings\": [{\"statement\": string, \"evidence\": [entity names], \"confidence\": number \
between 0 and 1}]}. If the context does not answer the question, return an empty findings list.";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecialistQueryRequest {
    pub query: String,
    pub deal_id: String,
    pub organization_id: String,
    /// Restrict the answer to these documents of the deal.
    #[serde(default)]
    pub document_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub statement: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub entity_name: String,
    pub entity_type: String,
    pub summary: String,
    pub facts: Vec<String>,
    pub episodes: Vec<String>,
    pub score: f32,
}

impl From<GraphHit> for Source {
    fn from(hit: GraphHit) -> Self {
        Self {
            entity_name: hit.entity_name,
            entity_type: hit.entity_type,
            summary: hit.summary,
            facts: hit.facts,
            episodes: hit.episode_names,
            score: hit.score,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDocument {
    pub id: Uuid,
    pub name: String,
    pub status: DocumentStatus,
    /// Job queued by this request; `None` for documents parked in `error`.
    pub job_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryUsage {
    pub model: String,
    pub fell_back: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    pub estimated_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecialistQueryResponse {
    pub findings: Vec<Finding>,
    pub sources: Vec<Source>,
    pub pending_documents: Vec<PendingDocument>,
    /// Specialist call accounting; `None` when no graph context was found.
    pub usage: Option<QueryUsage>,
}

#[derive(Deserialize)]
struct SpecialistAnswer {
    #[serde(default)]
    findings: Vec<Finding>,
}

/// Read findings from model output.
///
/// Output that is not the requested JSON shape becomes a single finding
/// holding the raw text.
pub fn parse_findings(raw: &str) -> Vec<Finding> {
    let parsed = json_object_slice(raw)
        .and_then(|json| serde_json::from_str::<SpecialistAnswer>(json).ok());
    match parsed {
        Some(answer) => answer
            .findings
            .into_iter()
            .filter(|f| !f.statement.trim().is_empty())
            .collect(),
        None if raw.trim().is_empty() => Vec::new(),
        None => {
            debug!(subsystem = "api", component = "specialist", "Unstructured specialist output");
            vec![Finding {
                statement: raw.trim().to_string(),
                evidence: Vec::new(),
                confidence: None,
            }]
        }
    }
}

fn build_specialist_prompt(query: &str, hits: &[GraphHit]) -> Prompt {
    let mut context = String::new();
    for hit in hits {
        context.push_str(&format!(
            "- {} ({}): {}\n",
            hit.entity_name, hit.entity_type, hit.summary
        ));
        for fact in &hit.facts {
            context.push_str(&format!("  - {}\n", fact));
        }
    }
    Prompt::new(format!(
        "Question: {}\n\nKnowledge graph context:\n{}",
        query.trim(),
        context
    ))
    .with_system(SPECIALIST_SYSTEM_PROMPT)
    .json()
}

/// Documents the query covers: the whole deal, or the requested subset.
async fn documents_in_scope(
    state: &AppState,
    namespace: &Namespace,
    requested: Option<&[Uuid]>,
) -> Result<Vec<Document>, ApiError> {
    let all = state.documents.list_for_deal(namespace).await?;
    let Some(ids) = requested else {
        return Ok(all);
    };
    let wanted: HashSet<Uuid> = ids.iter().copied().collect();
    let (scoped, rest): (Vec<Document>, Vec<Document>) =
        all.into_iter().partition(|d| wanted.contains(&d.id));
    if let Some(missing) = ids.iter().find(|id| !scoped.iter().any(|d| d.id == **id)) {
        return Err(ApiError::NotFound(format!(
            "Document {} not found in deal {}",
            missing, namespace
        )));
    }
    if let Some(shared) = scoped
        .iter()
        .find(|d| rest.iter().any(|other| other.name == d.name))
    {
        return Err(ApiError::Conflict(format!(
            "Document name '{}' is shared by another document in deal {}; \
             include both or rename one",
            shared.name, namespace
        )));
    }
    Ok(scoped)
}

/// `POST /api/v1/specialist/query`
#[instrument(
    skip_all,
    fields(
        subsystem = "api",
        component = "specialist",
        namespace = %format!("{}:{}", request.organization_id, request.deal_id),
    )
)]
pub async fn query_specialist(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(request): Json<SpecialistQueryRequest>,
) -> Result<Json<SpecialistQueryResponse>, ApiError> {
    let start = Instant::now();
    tenant.authorize(&request.organization_id)?;
    if request.query.trim().is_empty() {
        return Err(ApiError::BadRequest("Query must not be empty".to_string()));
    }
    let namespace = Namespace::new(request.organization_id.clone(), request.deal_id.clone())?;
    let context = UsageContext::for_namespace(&namespace);

    let documents = documents_in_scope(&state, &namespace, request.document_ids.as_deref()).await?;
    let mut pending_documents = Vec::new();
    for document in documents.iter().filter(|d| d.status != DocumentStatus::Ready) {
        let job_id = state.stages.ensure_enqueued(document).await?;
        pending_documents.push(PendingDocument {
            id: document.id,
            name: document.name.clone(),
            status: document.status,
            job_id,
        });
    }

    let query_text = request.query.trim().to_string();
    let embedded = state
        .embeddings
        .embed_with_usage(std::slice::from_ref(&query_text))
        .await?;
    embedded
        .log_usage(&state.usage, defaults::FEATURE_EMBEDDING, &context)
        .await;

    let mut hits = state
        .graph
        .search(
            &namespace,
            &GraphQuery {
                text: query_text.clone(),
                vector: embedded.vectors.into_iter().next(),
                limit: defaults::GRAPH_SEARCH_LIMIT,
            },
        )
        .await?;
    if request.document_ids.is_some() {
        let prefixes: Vec<String> = documents
            .iter()
            .map(|d| format!("{}#chunk-", d.name))
            .collect();
        hits.retain(|hit| {
            hit.episode_names
                .iter()
                .any(|e| prefixes.iter().any(|p| e.starts_with(p.as_str())))
        });
    }

    let (findings, usage) = if hits.is_empty() {
        (Vec::new(), None)
    } else {
        let out = state
            .specialist
            .complete(&build_specialist_prompt(&query_text, &hits))
            .await?;
        state
            .usage
            .log(
                &out.usage,
                &out.served_by,
                defaults::FEATURE_SPECIALIST,
                &context,
            )
            .await;
        let usage = QueryUsage {
            model: out.served_by.to_string(),
            fell_back: out.fell_back,
            input_tokens: out.usage.input_tokens,
            output_tokens: out.usage.output_tokens,
            latency_ms: out.usage.latency_ms,
            estimated_cost_usd: state.usage.cost(&out.served_by, &out.usage),
        };
        (parse_findings(&out.output), Some(usage))
    };

    info!(
        finding_count = findings.len(),
        source_count = hits.len(),
        pending_count = pending_documents.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Specialist query answered"
    );

    Ok(Json(SpecialistQueryResponse {
        findings,
        sources: hits.into_iter().map(Source::from).collect(),
        pending_documents,
        usage,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_findings_structured() {
        let raw = r#"```json
{"findings": [
  {"statement": "Acme owns Beta.", "evidence": ["Acme Corp"], "confidence": 0.9},
  {"statement": "  "}
]}
```"#;
        let findings = parse_findings(raw);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].statement, "Acme owns Beta.");
        assert_eq!(findings[0].evidence, vec!["Acme Corp".to_string()]);
        assert_eq!(findings[0].confidence, Some(0.9));
    }

    #[test]
    fn test_parse_findings_unstructured_text() {
        let findings = parse_findings("  Revenue grew 12% year over year. ");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].statement, "Revenue grew 12% year over year.");
        assert!(findings[0].evidence.is_empty());
        assert!(parse_findings("   ").is_empty());
    }

    #[test]
    fn test_prompt_lists_entities_and_facts() {
        let hits = vec![GraphHit {
            entity_name: "Beta LLC".into(),
            entity_type: "Company".into(),
            summary: "Target".into(),
            facts: vec!["Acme Corp owns 100% of Beta LLC.".into()],
            episode_names: vec!["cim.pdf#chunk-0".into()],
            score: 0.8,
        }];
        let prompt = build_specialist_prompt(" Who owns Beta? ", &hits);
        assert!(prompt.user.starts_with("Question: Who owns Beta?\n"));
        assert!(prompt.user.contains("- Beta LLC (Company): Target\n"));
        assert!(prompt.user.contains("  - Acme Corp owns 100% of Beta LLC.\n"));
        assert!(prompt.json_output);
    }
}

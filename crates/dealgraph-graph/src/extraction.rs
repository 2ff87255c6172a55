//! Entity/relationship extraction prompt and response parsing.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use dealgraph_core::{
    normalize_entity_name, Episode, Error, ExtractedEntity, ExtractedRelationship, Extraction,
    GraphSchema, Prompt, Result,
};

/// Edge type used when the model invents one outside the schema.
const FALLBACK_EDGE_TYPE: &str = "RELATED_TO";

/// Build the extraction prompt for one episode.
pub fn build_extraction_prompt(episode: &Episode, schema: &GraphSchema) -> Prompt {
    let system = format!(
        r#"You extract a knowledge graph from due-diligence documents.

Allowed entity types: {entity_types}
Allowed relationship types: {edge_types}

Return ONLY a JSON object of the form:
{{"entities": [{{"name": "...", "entity_type": "...", "summary": "..."}}],
 "relationships": [{{"source": "...", "target": "...", "relation_type": "...", "fact": "..."}}]}}

Rules:
- Use only the allowed types.
- Every relationship source and target must be the name of an extracted entity.
- "fact" is one self-contained sentence stating the relationship, including figures and dates.
- If nothing relevant is present, return {{"entities": [], "relationships": []}}."#,
        entity_types = schema.entity_types.join(", "),
        edge_types = schema.edge_types.join(", "),
    );

    let user = format!(
        "Source: {source}\nEpisode: {name}\n\n{content}",
        source = episode.source_description,
        name = episode.name,
        content = episode.content,
    );

    Prompt::new(user).with_system(system).json()
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default, alias = "edges", alias = "relations")]
    relationships: Vec<RawRelationship>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    #[serde(alias = "type", alias = "label")]
    entity_type: String,
    #[serde(default, alias = "description")]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
    #[serde(alias = "subject")]
    source: String,
    #[serde(alias = "object")]
    target: String,
    #[serde(alias = "type", alias = "predicate")]
    relation_type: String,
    #[serde(default)]
    fact: Option<String>,
}

fn fence_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").ok())
        .as_ref()
}

/// Pull the JSON object out of possibly fenced or chatty model output.
pub fn json_object_slice(raw: &str) -> Option<&str> {
    let body = fence_regex()
        .and_then(|re| re.captures(raw))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (start < end).then(|| &body[start..=end])
}

/// Parse and constrain a model response to `schema`.
///
/// Unparseable output is an `Error::Extraction`. Entities of unknown type are
/// dropped, entities are deduplicated by normalized name, relationships must
/// join two kept entities, and unknown edge types collapse to `RELATED_TO`.
pub fn parse_extraction(raw: &str, schema: &GraphSchema) -> Result<Extraction> {
    let json = json_object_slice(raw).ok_or_else(|| {
        Error::Extraction(format!(
            "no JSON object in model output ({} chars)",
            raw.len()
        ))
    })?;
    let parsed: RawExtraction = serde_json::from_str(json)
        .map_err(|e| Error::Extraction(format!("malformed extraction JSON: {}", e)))?;

    let mut seen = HashSet::new();
    let mut entities = Vec::with_capacity(parsed.entities.len());
    for raw_entity in parsed.entities {
        let name = raw_entity.name.trim();
        if name.is_empty() {
            continue;
        }
        if !schema.allows_entity(&raw_entity.entity_type) {
            debug!(
                subsystem = "graph",
                component = "extraction",
                entity_type = %raw_entity.entity_type,
                "Dropping entity of unknown type"
            );
            continue;
        }
        if !seen.insert(normalize_entity_name(name)) {
            continue;
        }
        entities.push(ExtractedEntity {
            name: name.to_string(),
            entity_type: raw_entity.entity_type,
            summary: raw_entity.summary.unwrap_or_default().trim().to_string(),
        });
    }

    let mut relationships = Vec::with_capacity(parsed.relationships.len());
    for rel in parsed.relationships {
        let source = rel.source.trim();
        let target = rel.target.trim();
        if !seen.contains(&normalize_entity_name(source))
            || !seen.contains(&normalize_entity_name(target))
        {
            continue;
        }
        let upper = rel.relation_type.trim().to_uppercase().replace([' ', '-'], "_");
        let relation_type = if schema.allows_edge(&upper) {
            upper
        } else if schema.allows_edge(FALLBACK_EDGE_TYPE) {
            FALLBACK_EDGE_TYPE.to_string()
        } else {
            continue;
        };
        let fact = rel
            .fact
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| format!("{} {} {}", source, relation_type, target));
        relationships.push(ExtractedRelationship {
            source: source.to_string(),
            target: target.to_string(),
            relation_type,
            fact,
        });
    }

    Ok(Extraction {
        entities,
        relationships,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealgraph_core::Namespace;

    fn schema() -> GraphSchema {
        GraphSchema::due_diligence()
    }

    #[test]
    fn test_prompt_lists_types_and_requests_json() {
        let episode = Episode {
            name: "CIM.pdf#chunk-0".into(),
            content: "Acme Corp owns Beta LLC.".into(),
            source_description: "document 'CIM.pdf' | page 1".into(),
            namespace: Namespace::new("o", "d").unwrap(),
        };
        let prompt = build_extraction_prompt(&episode, &schema());
        assert!(prompt.json_output);
        let system = prompt.system.unwrap();
        assert!(system.contains("Company"));
        assert!(system.contains("SUBSIDIARY_OF"));
        assert!(prompt.user.contains("CIM.pdf#chunk-0"));
        assert!(prompt.user.contains("Acme Corp owns Beta LLC."));
    }

    #[test]
    fn test_parse_plain_json() {
        let raw = r#"{"entities": [
            {"name": "Acme Corp", "entity_type": "Company", "summary": "Buyer"},
            {"name": "Beta LLC", "entity_type": "Company"}
        ], "relationships": [
            {"source": "Acme Corp", "target": "Beta LLC", "relation_type": "OWNS", "fact": "Acme Corp owns 100% of Beta LLC."}
        ]}"#;
        let extraction = parse_extraction(raw, &schema()).unwrap();
        assert_eq!(extraction.entities.len(), 2);
        assert_eq!(extraction.entities[1].summary, "");
        assert_eq!(extraction.relationships[0].relation_type, "OWNS");
    }

    #[test]
    fn test_parse_fenced_with_aliases() {
        let raw = "Here you go:\n```json\n{\"entities\": [{\"name\": \"Jane Doe\", \"type\": \"Person\"}, {\"name\": \"Acme\", \"type\": \"Company\"}], \"edges\": [{\"subject\": \"Acme\", \"object\": \"Jane Doe\", \"predicate\": \"employs\"}]}\n```";
        let extraction = parse_extraction(raw, &schema()).unwrap();
        assert_eq!(extraction.entities.len(), 2);
        let rel = &extraction.relationships[0];
        assert_eq!(rel.relation_type, "EMPLOYS");
        assert_eq!(rel.fact, "Acme EMPLOYS Jane Doe");
    }

    #[test]
    fn test_unknown_types_dropped_or_collapsed() {
        let raw = r#"{"entities": [
            {"name": "Acme", "entity_type": "Company"},
            {"name": "Mars", "entity_type": "Planet"},
            {"name": "Beta", "entity_type": "Company"}
        ], "relationships": [
            {"source": "Acme", "target": "Mars", "relation_type": "OWNS"},
            {"source": "Acme", "target": "Beta", "relation_type": "competes with", "fact": "They compete."}
        ]}"#;
        let extraction = parse_extraction(raw, &schema()).unwrap();
        assert_eq!(extraction.entities.len(), 2);
        assert_eq!(extraction.relationships.len(), 1);
        assert_eq!(extraction.relationships[0].relation_type, "RELATED_TO");
    }

    #[test]
    fn test_duplicate_entities_merged_by_normalized_name() {
        let raw = r#"{"entities": [
            {"name": "Acme Corp", "entity_type": "Company"},
            {"name": "ACME  corp", "entity_type": "Company"}
        ]}"#;
        let extraction = parse_extraction(raw, &schema()).unwrap();
        assert_eq!(extraction.entities.len(), 1);
        assert!(extraction.relationships.is_empty());
    }

    #[test]
    fn test_non_json_is_extraction_error() {
        let err = parse_extraction("I could not find any entities.", &schema()).unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
        assert!(err.is_retryable());
        assert!(!err.is_provider_transient());
    }

    #[test]
    fn test_truncated_json_is_extraction_error() {
        let err = parse_extraction(r#"{"entities": [{"name": "Acme", "#, &schema()).unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
    }

    #[test]
    fn test_empty_object_is_ok() {
        let extraction = parse_extraction("{}", &schema()).unwrap();
        assert_eq!(extraction, Extraction::default());
    }
}

//! Episode construction from parsed chunks.

use dealgraph_core::{Chunk, ChunkType, Episode, Namespace};

/// Deterministic episode name: `{document_name}#chunk-{chunk_index}`.
///
/// Re-ingesting the same document produces the same names, which is what
/// makes graph writes idempotent on retry.
pub fn episode_name(document_name: &str, chunk_index: i32) -> String {
    format!("{}#chunk-{}", document_name, chunk_index)
}

/// Human-readable provenance, e.g. `document 'Q3.xlsx' | sheet Revenue | type table`.
pub fn source_description(document_name: &str, chunk: &Chunk) -> String {
    let mut parts = vec![format!("document '{}'", document_name)];
    if let Some(page) = chunk.page_number {
        parts.push(format!("page {}", page));
    }
    if let Some(sheet) = chunk.sheet_name.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("sheet {}", sheet));
    }
    if chunk.chunk_type != ChunkType::Text {
        parts.push(format!("type {}", chunk.chunk_type.as_str()));
    }
    parts.join(" | ")
}

pub fn build_episode(document_name: &str, chunk: &Chunk, namespace: &Namespace) -> Episode {
    Episode {
        name: episode_name(document_name, chunk.chunk_index),
        content: chunk.content.clone(),
        source_description: source_description(document_name, chunk),
        namespace: namespace.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn chunk(index: i32, page: Option<i32>, sheet: Option<&str>, chunk_type: ChunkType) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            document_id: Uuid::nil(),
            content: "Revenue grew 12% year over year.".to_string(),
            chunk_index: index,
            page_number: page,
            sheet_name: sheet.map(str::to_string),
            chunk_type,
        }
    }

    #[test]
    fn test_episode_name_format() {
        assert_eq!(episode_name("Q3.xlsx", 4), "Q3.xlsx#chunk-4");
    }

    #[test]
    fn test_source_description_sheet_table() {
        let c = chunk(0, None, Some("Revenue"), ChunkType::Table);
        assert_eq!(
            source_description("Q3.xlsx", &c),
            "document 'Q3.xlsx' | sheet Revenue | type table"
        );
    }

    #[test]
    fn test_source_description_page_text() {
        let c = chunk(2, Some(7), None, ChunkType::Text);
        assert_eq!(source_description("CIM.pdf", &c), "document 'CIM.pdf' | page 7");
    }

    #[test]
    fn test_build_episode_is_deterministic() {
        let ns = Namespace::new("orgA", "deal1").unwrap();
        let c = chunk(3, Some(1), None, ChunkType::Heading);
        let a = build_episode("CIM.pdf", &c, &ns);
        let b = build_episode("CIM.pdf", &c, &ns);
        assert_eq!(a, b);
        assert_eq!(a.name, "CIM.pdf#chunk-3");
        assert_eq!(a.namespace, ns);
    }
}

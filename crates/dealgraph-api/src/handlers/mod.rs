//! HTTP handlers for dealgraph-api.

pub mod documents;
pub mod health;
pub mod specialist;

pub use documents::{get_stage, retry_document, RetryAccepted, RetryRequest};
pub use health::health_check;
pub use specialist::{
    parse_findings, query_specialist, Finding, PendingDocument, QueryUsage, Source,
    SpecialistQueryRequest, SpecialistQueryResponse,
};

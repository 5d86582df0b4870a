use serde::Serialize;

use crate::models::document::{DocumentRef, DocumentStatus};

pub const NO_DOCUMENTS_MESSAGE: &str = "no documents uploaded";
pub const WAITING_MESSAGE: &str = "waiting for processing";
pub const NOT_READY_MESSAGE: &str = "no processed documents";

/// True iff at least one document finished processing.
pub fn can_request(documents: &[DocumentRef]) -> bool {
    documents
        .iter()
        .any(|doc| doc.status == DocumentStatus::Processed)
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Readiness {
    #[default]
    NoDocuments,
    Waiting,
    Ready,
}

impl Readiness {
    pub fn evaluate(documents: &[DocumentRef]) -> Self {
        if documents.is_empty() {
            Readiness::NoDocuments
        } else if can_request(documents) {
            Readiness::Ready
        } else {
            Readiness::Waiting
        }
    }

    pub fn can_request(&self) -> bool {
        matches!(self, Readiness::Ready)
    }

    pub fn message(&self) -> Option<&'static str> {
        match self {
            Readiness::NoDocuments => Some(NO_DOCUMENTS_MESSAGE),
            Readiness::Waiting => Some(WAITING_MESSAGE),
            Readiness::Ready => None,
        }
    }
}

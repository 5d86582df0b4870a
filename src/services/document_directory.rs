use tracing::{debug, warn};

use crate::error::AppResult;
use crate::models::document::{DocumentListResponse, DocumentRef};

/// Read access to the user's uploaded documents.
#[async_trait::async_trait]
pub trait DocumentDirectory: Send + Sync {
    async fn get_user_documents(&self) -> AppResult<DocumentListResponse>;
}

/// One-shot pull of the document set.
///
/// Never fails: a transport error or `success = false` degrades to an empty
/// set, which the readiness gate reports as "no documents".
pub async fn refresh(directory: &dyn DocumentDirectory) -> Vec<DocumentRef> {
    match directory.get_user_documents().await {
        Ok(DocumentListResponse {
            success: true,
            documents,
            ..
        }) => {
            let documents = documents.unwrap_or_default();
            debug!(target: "app::directory", count = documents.len(), "document snapshot refreshed");
            documents
        }
        Ok(DocumentListResponse { message, .. }) => {
            warn!(
                target: "app::directory",
                message = message.as_deref().unwrap_or("unspecified"),
                "document directory reported failure; treating as empty"
            );
            Vec::new()
        }
        Err(error) => {
            warn!(target: "app::directory", error = %error, "document fetch failed; treating as empty");
            Vec::new()
        }
    }
}

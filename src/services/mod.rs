pub mod document_directory;
pub mod orchestrator;
pub mod prediction_service;
pub mod readiness;
pub mod result_feed;

pub mod document;
pub mod prediction;
pub mod session;
pub mod settings;

pub mod auth_service;
pub mod chunk_store;
pub mod error;
pub mod metadata_index;
pub mod streaming;
pub mod upload_pipeline;

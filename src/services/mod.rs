//! Service layer: everything below the HTTP handlers.

pub mod accountant;
pub mod assembler;
pub mod blob_store;
pub mod chunk_receiver;
pub mod chunk_staging;
pub mod content_registry;
pub mod error;
pub mod maintenance;
pub mod offload;
pub mod progress;
pub mod recycle_bin;
pub mod redis_session_store;
pub mod session_store;
pub mod upload_service;

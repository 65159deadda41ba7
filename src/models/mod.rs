//! Core data models for the cloud storage backend.
//!
//! Relational entities map to tables via `sqlx::FromRow` and serialize
//! as JSON via `serde`. `UploadSession` lives in the session store rather
//! than in SQLite.

pub mod content;
pub mod file;
pub mod file_store;
pub mod folder;
pub mod recycle_bin;
pub mod session;

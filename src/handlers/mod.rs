pub mod caller;
pub mod file_handlers;
pub mod health_handlers;
pub mod recycle_handlers;
pub mod upload_handlers;

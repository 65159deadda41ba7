//! Defines routes for the storage API.
//!
//! ## Structure
//! - **Health**: `GET /healthz`, `GET /readyz`
//! - **Store**: `POST|GET /api/v1/store`
//! - **Folders**: `POST /api/v1/folders`, `GET|PATCH|DELETE /api/v1/folders/{id}`
//! - **Files**: `PATCH|DELETE /api/v1/files/{id}` (delete moves to the recycle bin)
//! - **Uploads**:
//!   - `POST   /api/v1/uploads` open a session
//!   - `GET    /api/v1/uploads/{id}` progress
//!   - `DELETE /api/v1/uploads/{id}` abort
//!   - `PUT    /api/v1/uploads/{id}/chunks/{index}` chunk body (raw bytes)
//!   - `POST   /api/v1/uploads/{id}/complete`
//! - **Recycle bin**: `GET|DELETE /api/v1/recycle-bin`,
//!   `POST /api/v1/recycle-bin/{id}/restore`, `GET|PUT /api/v1/recycle-bin/config`
//!
//! Every `/api/v1` route identifies the caller by the `x-user-id` header.

use crate::{
    handlers::{
        file_handlers::{
            create_folder, delete_file, delete_folder, get_folder, get_store, move_file,
            move_folder, provision_store,
        },
        health_handlers::{healthz, readyz},
        recycle_handlers::{
            empty_recycle_bin, get_config, list_recycle_bin, restore_entry, update_config,
        },
        upload_handlers::{abort_upload, complete_upload, get_upload, open_upload, upload_chunk},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, patch, post, put},
};

/// Build the router for every API route.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/v1/store", post(provision_store).get(get_store))
        .route("/api/v1/folders", post(create_folder))
        .route(
            "/api/v1/folders/{id}",
            get(get_folder).patch(move_folder).delete(delete_folder),
        )
        .route("/api/v1/files/{id}", patch(move_file).delete(delete_file))
        .route("/api/v1/uploads", post(open_upload))
        .route("/api/v1/uploads/{id}", get(get_upload).delete(abort_upload))
        .route("/api/v1/uploads/{id}/chunks/{index}", put(upload_chunk))
        .route("/api/v1/uploads/{id}/complete", post(complete_upload))
        .route(
            "/api/v1/recycle-bin",
            get(list_recycle_bin).delete(empty_recycle_bin),
        )
        .route("/api/v1/recycle-bin/{id}/restore", post(restore_entry))
        .route(
            "/api/v1/recycle-bin/config",
            get(get_config).put(update_config),
        )
}

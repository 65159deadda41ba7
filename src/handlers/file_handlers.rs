//! HTTP handlers for stores, folders and files.

use crate::{
    errors::AppError,
    handlers::caller::Caller,
    models::{file::FileRecord, file_store::FileStore, folder::FileFolder, recycle_bin::RecycleBinEntry},
    services::accountant::FolderDeletion,
    state::AppState,
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

/// Body of `POST /api/v1/store`; an empty body takes the default quota.
#[derive(Debug, Default, Deserialize)]
pub struct ProvisionReq {
    pub max_size: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct StoreResp {
    pub store: FileStore,
    pub root_folder: FileFolder,
}

#[derive(Debug, Deserialize)]
pub struct CreateFolderReq {
    pub name: String,
    pub parent_id: String,
}

#[derive(Debug, Serialize)]
pub struct FolderResp {
    pub folder: FileFolder,
    pub folders: Vec<FileFolder>,
    pub files: Vec<FileRecord>,
}

/// Body of `PATCH /api/v1/folders/{id}`.
#[derive(Debug, Deserialize)]
pub struct MoveFolderReq {
    pub parent_id: Option<String>,
    pub name: Option<String>,
}

/// Body of `PATCH /api/v1/files/{id}`.
#[derive(Debug, Deserialize)]
pub struct MoveFileReq {
    pub folder_id: Option<String>,
    pub name: Option<String>,
}

pub async fn provision_store(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    body: Bytes,
) -> Result<(StatusCode, Json<StoreResp>), AppError> {
    let req: ProvisionReq = if body.is_empty() {
        ProvisionReq::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::bad_request(format!("invalid request body: {}", err)))?
    };
    let (store, root_folder) = state.accountant.provision(&user_id, req.max_size).await?;
    Ok((StatusCode::CREATED, Json(StoreResp { store, root_folder })))
}

pub async fn get_store(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> Result<Json<FileStore>, AppError> {
    Ok(Json(state.accountant.store_info(&user_id).await?))
}

pub async fn create_folder(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(req): Json<CreateFolderReq>,
) -> Result<(StatusCode, Json<FileFolder>), AppError> {
    let folder = state
        .accountant
        .create_folder(&user_id, &req.name, &req.parent_id)
        .await?;
    Ok((StatusCode::CREATED, Json(folder)))
}

/// A folder and its direct children.
pub async fn get_folder(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(folder_id): Path<String>,
) -> Result<Json<FolderResp>, AppError> {
    let (folder, folders, files) = state.accountant.folder_listing(&user_id, &folder_id).await?;
    Ok(Json(FolderResp {
        folder,
        folders,
        files,
    }))
}

pub async fn delete_folder(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(folder_id): Path<String>,
) -> Result<Json<FolderDeletion>, AppError> {
    Ok(Json(state.accountant.delete_folder(&user_id, &folder_id).await?))
}

pub async fn move_folder(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(folder_id): Path<String>,
    Json(req): Json<MoveFolderReq>,
) -> Result<Json<FileFolder>, AppError> {
    if req.parent_id.is_none() && req.name.is_none() {
        return Err(AppError::bad_request("nothing to change: give `parent_id` or `name`"));
    }
    let folder = state
        .accountant
        .move_folder(&user_id, &folder_id, req.parent_id.as_deref(), req.name.as_deref())
        .await?;
    Ok(Json(folder))
}

pub async fn move_file(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(file_id): Path<String>,
    Json(req): Json<MoveFileReq>,
) -> Result<Json<FileRecord>, AppError> {
    if req.folder_id.is_none() && req.name.is_none() {
        return Err(AppError::bad_request("nothing to change: give `folder_id` or `name`"));
    }
    let file = state
        .accountant
        .move_file(&user_id, &file_id, req.folder_id.as_deref(), req.name.as_deref())
        .await?;
    Ok(Json(file))
}

/// Logical delete: the file moves to the recycle bin.
pub async fn delete_file(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(file_id): Path<String>,
) -> Result<Json<RecycleBinEntry>, AppError> {
    Ok(Json(state.recycle.logical_delete(&user_id, &file_id).await?))
}

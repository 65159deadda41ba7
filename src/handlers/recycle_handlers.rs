//! HTTP handlers for the recycle bin.

use crate::{
    errors::AppError,
    handlers::caller::Caller,
    models::recycle_bin::RecycleBinConfig,
    services::recycle_bin::{
        DEFAULT_PAGE_SIZE, EvictionReport, RecycleBinConfigUpdate, RecycleBinPage, RestoredFile,
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

pub async fn list_recycle_bin(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Query(q): Query<ListQuery>,
) -> Result<Json<RecycleBinPage>, AppError> {
    let page = state
        .recycle
        .list(
            &user_id,
            q.page.unwrap_or(1),
            q.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(Json(page))
}

pub async fn empty_recycle_bin(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> Result<Json<EvictionReport>, AppError> {
    Ok(Json(state.recycle.empty(&user_id).await?))
}

pub async fn restore_entry(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(entry_id): Path<String>,
) -> Result<Json<RestoredFile>, AppError> {
    Ok(Json(state.recycle.restore(&user_id, &entry_id).await?))
}

pub async fn get_config(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> Result<Json<RecycleBinConfig>, AppError> {
    Ok(Json(state.recycle.get_config(&user_id).await?))
}

pub async fn update_config(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(update): Json<RecycleBinConfigUpdate>,
) -> Result<Json<RecycleBinConfig>, AppError> {
    Ok(Json(state.recycle.update_config(&user_id, update).await?))
}

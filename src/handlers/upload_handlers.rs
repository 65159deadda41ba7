//! HTTP handlers for chunked uploads.
//! Chunk bodies are streamed to staging without buffering them in memory.

use crate::{
    errors::AppError,
    handlers::caller::Caller,
    services::{
        assembler::CompletedUpload, chunk_receiver::ChunkAck, progress::ProgressReport,
        upload_service::UploadPlan,
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use base64::{Engine as _, engine::general_purpose};
use futures::StreamExt;
use serde::Deserialize;
use std::io;

const CONTENT_MD5: &str = "content-md5";

/// Body of `POST /api/v1/uploads`.
#[derive(Debug, Deserialize)]
pub struct OpenUploadReq {
    pub file_name: String,
    pub file_size: i64,
    pub folder_id: String,
}

/// Open an upload session.
pub async fn open_upload(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(req): Json<OpenUploadReq>,
) -> Result<(StatusCode, Json<UploadPlan>), AppError> {
    let plan = state
        .uploads
        .open_session(&user_id, &req.file_name, req.file_size, &req.folder_id)
        .await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

/// Upload one chunk to `/api/v1/uploads/{id}/chunks/{index}`.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path((upload_id, index)): Path<(String, u32)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ChunkAck>, AppError> {
    let content_md5 = parse_content_md5(&headers)?;
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let ack = state
        .uploads
        .submit_chunk(&user_id, &upload_id, index, content_md5, stream)
        .await?;
    Ok(Json(ack))
}

/// Progress of an upload session.
pub async fn get_upload(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(upload_id): Path<String>,
) -> Result<Json<ProgressReport>, AppError> {
    Ok(Json(state.uploads.inspect(&user_id, &upload_id).await?))
}

pub async fn complete_upload(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(upload_id): Path<String>,
) -> Result<Json<CompletedUpload>, AppError> {
    Ok(Json(state.uploads.complete(&user_id, &upload_id).await?))
}

pub async fn abort_upload(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.uploads.abort_session(&user_id, &upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Decode an optional base64 `Content-MD5` header into raw digest bytes.
fn parse_content_md5(headers: &HeaderMap) -> Result<Option<[u8; 16]>, AppError> {
    let Some(value) = headers.get(CONTENT_MD5) else {
        return Ok(None);
    };
    let decoded = value
        .to_str()
        .ok()
        .and_then(|v| general_purpose::STANDARD.decode(v.trim()).ok())
        .ok_or_else(|| AppError::bad_request("Content-MD5 is not valid base64"))?;
    let digest: [u8; 16] = decoded
        .try_into()
        .map_err(|_| AppError::bad_request("Content-MD5 must encode 16 bytes"))?;
    Ok(Some(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn content_md5_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_content_md5(&headers).unwrap(), None);

        let digest = md5::compute(b"abc").0;
        let encoded = general_purpose::STANDARD.encode(digest);
        headers.insert(CONTENT_MD5, HeaderValue::from_str(&encoded).unwrap());
        assert_eq!(parse_content_md5(&headers).unwrap(), Some(digest));

        headers.insert(CONTENT_MD5, HeaderValue::from_static("YWJj"));
        assert_eq!(
            parse_content_md5(&headers).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
    }
}

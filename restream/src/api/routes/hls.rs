//! Segmented output files: `GET /hls/{id}/{file}`.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use super::stream::PLAYLIST_CONTENT_TYPE;
use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::session::SessionId;
use crate::utils::fs;

/// Content type for an output file, by extension.
pub fn content_type_for(file: &str) -> &'static str {
    let ext = file
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "ts" => "video/mp2t",
        "m3u8" => PLAYLIST_CONTENT_TYPE,
        "m4s" | "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// A single path component naming a regular file.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', ':', '\0'])
}

pub async fn hls_file_get(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
) -> ApiResult<Response> {
    let id = SessionId::parse(&id).ok_or_else(|| ApiError::not_found("Unknown stream"))?;
    if !is_plain_file_name(&file) {
        return Err(ApiError::not_found("File not found"));
    }

    if let Some(session) = state.registry.get(&id) {
        session.touch();
    }

    let path = state.registry.output_dir(&id).join(&file);
    let bytes = fs::read(&path).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&file)),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));

    Ok((StatusCode::OK, headers, bytes).into_response())
}
